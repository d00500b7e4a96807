// Copyright (c) Andrea Righi <andrea.righi@canonical.com>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Cache topology.
//!
//! CacheTopology provides, for each cache level the BPF component cares about (L2 and L3), the
//! groups of CPUs that share a cache instance. An example content on a 4-core SMT system with a
//! single LLC can be the following:
//!
//!  L2: [0, 4] [1, 5] [2, 6] [3, 7]
//!  L3: [0, 1, 2, 3, 4, 5, 6, 7]
//!
//! The groups are registered once at startup as sibling domains, so that the BPF CPU selection
//! can prefer idle CPUs sharing a cache with the previously used one.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::debug;

const CPU_PATH: &str = "/sys/devices/system/cpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheLevel {
    L2 = 2,
    L3 = 3,
}

impl CacheLevel {
    pub const ALL: [CacheLevel; 2] = [CacheLevel::L2, CacheLevel::L3];

    pub fn from_level(level: usize) -> Option<Self> {
        match level {
            2 => Some(CacheLevel::L2),
            3 => Some(CacheLevel::L3),
            _ => None,
        }
    }

    /// Level id passed to the BPF component.
    pub fn id(&self) -> i32 {
        *self as i32
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.id())
    }
}

/// Parse a kernel cpulist ("0-3,8,10-11").
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim().trim_end_matches('\0');
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let group = group.trim();
        let (min, max) = match group.split_once('-') {
            Some((min, max)) => (
                min.parse::<usize>()
                    .with_context(|| format!("Failed to parse cpulist {}", group))?,
                max.parse::<usize>()
                    .with_context(|| format!("Failed to parse cpulist {}", group))?,
            ),
            None => {
                let cpu = group
                    .parse::<usize>()
                    .with_context(|| format!("Failed to parse cpulist {}", group))?;
                (cpu, cpu)
            }
        };
        if min > max {
            bail!("Invalid range in cpulist {}", group);
        }
        cpu_ids.extend(min..=max);
    }

    Ok(cpu_ids)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheTopology {
    domains: BTreeMap<CacheLevel, Vec<Vec<usize>>>,
}

impl CacheTopology {
    /// Build a topology from explicit CPU groups; duplicate groups are merged.
    pub fn from_groups(groups: impl IntoIterator<Item = (CacheLevel, Vec<usize>)>) -> Self {
        let mut sets: BTreeMap<CacheLevel, BTreeSet<Vec<usize>>> = BTreeMap::new();
        for (level, mut cpus) in groups {
            cpus.sort_unstable();
            cpus.dedup();
            if !cpus.is_empty() {
                sets.entry(level).or_default().insert(cpus);
            }
        }

        Self {
            domains: sets
                .into_iter()
                .map(|(level, set)| (level, set.into_iter().collect()))
                .collect(),
        }
    }

    /// Read the host cache topology from sysfs.
    pub fn discover() -> Result<Self> {
        Self::from_sysfs(Path::new(CPU_PATH))
    }

    /// Read the cache topology from a sysfs-like tree rooted at `root`
    /// (`<root>/cpu<N>/cache/index<M>/{level,type,shared_cpu_list}`).
    pub fn from_sysfs(root: &Path) -> Result<Self> {
        let pattern = root.join("cpu[0-9]*/cache/index[0-9]*");
        let pattern = pattern
            .to_str()
            .with_context(|| format!("Invalid sysfs path {:?}", root))?;

        let mut groups = vec![];
        for path in glob(pattern)?.filter_map(Result::ok) {
            // Instruction caches don't matter for task placement.
            if let Ok(ty) = fs::read_to_string(path.join("type")) {
                if ty.trim() == "Instruction" {
                    continue;
                }
            }
            let level = match fs::read_to_string(path.join("level")) {
                Ok(level) => level
                    .trim()
                    .parse::<usize>()
                    .with_context(|| format!("Failed to parse {:?}", path.join("level")))?,
                Err(_) => continue,
            };
            let Some(level) = CacheLevel::from_level(level) else {
                continue;
            };
            let list_path = path.join("shared_cpu_list");
            let list = fs::read_to_string(&list_path)
                .with_context(|| format!("Failed to read {:?}", list_path))?;
            groups.push((level, read_cpulist(&list)?));
        }

        let topo = Self::from_groups(groups);
        for (level, groups) in topo.domains.iter() {
            debug!("{} cache domains: {:?}", level, groups);
        }

        Ok(topo)
    }

    /// CPU groups sharing a cache at `level`.
    pub fn groups(&self, level: CacheLevel) -> &[Vec<usize>] {
        self.domains.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Total amount of (cpu, sibling) pairs across all levels, self pairs included.
    pub fn nr_sibling_pairs(&self) -> usize {
        self.domains
            .values()
            .flat_map(|groups| groups.iter())
            .map(|cpus| cpus.len() * cpus.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    fn add_cache(root: &Path, cpu: usize, index: usize, level: usize, ty: &str, list: &str) {
        let dir: PathBuf = root.join(format!("cpu{}/cache/index{}", cpu, index));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("level"), format!("{}\n", level)).unwrap();
        fs::write(dir.join("type"), format!("{}\n", ty)).unwrap();
        fs::write(dir.join("shared_cpu_list"), format!("{}\n", list)).unwrap();
    }

    #[test]
    fn test_read_cpulist() {
        assert_eq!(read_cpulist("0-3,8\n").unwrap(), vec![0, 1, 2, 3, 8]);
        assert_eq!(read_cpulist("5").unwrap(), vec![5]);
        assert_eq!(read_cpulist("").unwrap(), Vec::<usize>::new());
        assert!(read_cpulist("3-1").is_err());
        assert!(read_cpulist("a-b").is_err());
        assert!(read_cpulist("1-2-3").is_err());
    }

    #[test]
    fn test_from_groups_dedup() {
        let topo = CacheTopology::from_groups(vec![
            (CacheLevel::L2, vec![1, 0]),
            (CacheLevel::L2, vec![0, 1]),
            (CacheLevel::L3, vec![0, 1, 2, 3]),
            (CacheLevel::L3, vec![]),
        ]);
        assert_eq!(topo.groups(CacheLevel::L2), &[vec![0, 1]]);
        assert_eq!(topo.groups(CacheLevel::L3), &[vec![0, 1, 2, 3]]);
        assert_eq!(topo.nr_sibling_pairs(), 4 + 16);
    }

    #[test]
    fn test_from_sysfs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for cpu in 0..4 {
            add_cache(root, cpu, 0, 1, "Data", &cpu.to_string());
            add_cache(root, cpu, 1, 1, "Instruction", &cpu.to_string());
            let l2 = if cpu % 2 == 0 { "0,2" } else { "1,3" };
            add_cache(root, cpu, 2, 2, "Unified", l2);
            add_cache(root, cpu, 3, 3, "Unified", "0-3");
        }
        // Not a CPU directory.
        fs::create_dir_all(root.join("cpufreq")).unwrap();

        let topo = CacheTopology::from_sysfs(root).unwrap();
        assert_eq!(topo.groups(CacheLevel::L2), &[vec![0, 2], vec![1, 3]]);
        assert_eq!(topo.groups(CacheLevel::L3), &[vec![0, 1, 2, 3]]);
    }

    #[test]
    fn test_from_sysfs_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let topo = CacheTopology::from_sysfs(tmp.path()).unwrap();
        assert!(topo.is_empty());
        assert!(topo.groups(CacheLevel::L3).is_empty());
    }

    #[test]
    fn test_level_display() {
        assert_eq!(CacheLevel::L2.to_string(), "L2");
        assert_eq!(CacheLevel::L3.id(), 3);
        assert_eq!(CacheLevel::from_level(1), None);
    }
}
