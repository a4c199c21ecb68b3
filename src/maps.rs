//! Enumeration of the modules loaded into the host process and translation
//! of absolute instruction addresses into `(module, offset)` pairs.
//!
//! The map is built exactly once, the first time a record needs resolving.
//! Modules loaded after that point are unknown to the map; their comparisons
//! resolve to nothing and are silently dropped, which is acceptable for the
//! static targets fuzzing cares about.

use std::path::Path;

use rangemap::RangeMap;

/// One loaded executable image or shared object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// Canonical short name: base filename with the extension dropped.
    pub name: String,
    /// Lowest mapped address of the image.
    pub base: usize,
    /// Span from `base` to the end of the highest mapping of the image.
    pub size: usize,
}

/// An ordered collection of [`Module`]s with a single query:
/// [`ModuleMap::locate`].
#[derive(Debug)]
pub struct ModuleMap {
    modules: Vec<Module>,
    ranges: RangeMap<usize, u16>,
}

impl Default for ModuleMap {
    fn default() -> Self {
        Self {
            modules: Vec::new(),
            ranges: RangeMap::new(),
        }
    }
}

impl ModuleMap {
    /// Enumerates the modules currently loaded into this process.
    ///
    /// If enumeration is unsupported or fails, the map is empty and every
    /// lookup misses; the callers drop such records.
    #[must_use]
    pub fn current() -> Self {
        match enumerate() {
            Ok(modules) => {
                log::debug!("module map: {} modules", modules.len());
                Self::from_modules(modules)
            }
            Err(err) => {
                log::warn!("module enumeration failed, dropping all records: {err}");
                Self::default()
            }
        }
    }

    /// Builds a map over the given modules. Entries beyond the first
    /// `u16::MAX` are ignored.
    #[must_use]
    pub fn from_modules(modules: Vec<Module>) -> Self {
        let mut ranges = RangeMap::new();
        for (index, module) in modules.iter().take(usize::from(u16::MAX)).enumerate() {
            if module.size > 0 {
                ranges.insert(module.base..module.base + module.size, index as u16);
            }
        }
        Self { modules, ranges }
    }

    /// Maps an absolute instruction address to `(module_index, pc_offset)`.
    #[must_use]
    pub fn locate(&self, addr: usize) -> Option<(u16, usize)> {
        let (range, &index) = self.ranges.get_key_value(&addr)?;
        Some((index, addr - range.start))
    }

    /// Number of known modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// `true` if enumeration yielded nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Short name of module `index`.
    #[must_use]
    pub fn name(&self, index: u16) -> Option<&str> {
        self.modules.get(usize::from(index)).map(|m| m.name.as_str())
    }
}

#[cfg(target_os = "linux")]
fn enumerate() -> std::io::Result<Vec<Module>> {
    let maps = std::fs::read_to_string("/proc/self/maps")?;
    Ok(parse_maps(&maps))
}

/// Module enumeration is only implemented where the kernel exports the
/// mapping table; elsewhere every lookup misses by design.
#[cfg(not(target_os = "linux"))]
fn enumerate() -> std::io::Result<Vec<Module>> {
    Ok(Vec::new())
}

/// Parses `/proc/self/maps` content into modules.
///
/// Lines look like
/// `55d1a9c26000-55d1a9c48000 r-xp 00002000 103:02 5505297 /usr/bin/target`.
/// Consecutive mappings of the same file are coalesced into one module
/// spanning from the first base to the last limit; a coalesced group counts
/// only if at least one of its segments is executable. Pseudo entries
/// (`[heap]`, `[vdso]`, anonymous) never form modules. The same basename
/// appearing under different directories stays distinct.
fn parse_maps(maps: &str) -> Vec<Module> {
    struct Group {
        path: String,
        base: usize,
        limit: usize,
        exec: bool,
    }

    let mut groups: Vec<Group> = Vec::new();

    for line in maps.lines() {
        let mut fields = line.splitn(6, ' ');
        let Some(range) = fields.next() else { continue };
        let Some(perms) = fields.next() else { continue };
        let path = match fields.nth(3) {
            Some(path) => path.trim_start(),
            None => continue,
        };
        if !path.starts_with('/') {
            continue;
        }

        let Some((base, limit)) = range.split_once('-') else {
            continue;
        };
        let (Ok(base), Ok(limit)) = (
            usize::from_str_radix(base, 16),
            usize::from_str_radix(limit, 16),
        ) else {
            continue;
        };
        let exec = perms.contains('x');

        match groups.last_mut() {
            Some(group) if group.path == path => {
                group.limit = group.limit.max(limit);
                group.exec |= exec;
            }
            _ => groups.push(Group {
                path: path.to_string(),
                base,
                limit,
                exec,
            }),
        }
    }

    groups
        .into_iter()
        .filter(|g| g.exec && g.limit > g.base)
        .map(|g| Module {
            name: short_name(&g.path),
            base: g.base,
            size: g.limit - g.base,
        })
        .collect()
}

/// Base filename with the extension dropped: `/usr/lib/libfoo.so` → `libfoo`.
fn short_name(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map_or_else(|| path.to_string(), |s| s.to_string_lossy().into_owned())
}
