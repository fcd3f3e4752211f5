//! Lookup of injector constructors by target and fault name.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

use crate::container::{ContainerKill, ContainerPause, ContainerRestart, ContainerRm};
use crate::cpu::CpuBurn;
use crate::disk::DiskFill;
use crate::diskio::{DiskioHang, DiskioLimit};
use crate::mem::{MemFill, MemOom};
use crate::process::{ProcessKill, ProcessStop};
use crate::{Error, Fault, FaultInjector, Injector, Result};

/// Builds a fresh injector with default arguments.
pub type Constructor = fn() -> Box<dyn Injector>;

fn construct<F: Fault>() -> Box<dyn Injector> {
    Box::new(FaultInjector::<F>::default())
}

/// Registration entry for fault `F`.
pub fn entry<F: Fault>() -> (&'static str, &'static str, Constructor) {
    (F::TARGET, F::FAULT, construct::<F> as Constructor)
}

pub fn key(target: &str, fault: &str) -> String {
    format!("{}-{}", target, fault)
}

pub struct Registry {
    entries: BTreeMap<String, (&'static str, &'static str, Constructor)>,
}

impl Registry {
    /// Panics on a duplicate (target, fault) pair.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, &'static str, Constructor)>,
    {
        let mut map = BTreeMap::new();
        for (target, fault, ctor) in entries {
            let k = key(target, fault);
            if map.insert(k.clone(), (target, fault, ctor)).is_some() {
                panic!("injector {} registered twice", k);
            }
        }
        Self { entries: map }
    }

    /// The built-in injectors.
    pub fn builtin() -> &'static Registry {
        static BUILTIN: Lazy<Registry> = Lazy::new(|| {
            Registry::from_entries([
                entry::<ContainerPause>(),
                entry::<ContainerRm>(),
                entry::<ContainerRestart>(),
                entry::<ContainerKill>(),
                entry::<CpuBurn>(),
                entry::<DiskFill>(),
                entry::<MemFill>(),
                entry::<MemOom>(),
                entry::<DiskioHang>(),
                entry::<DiskioLimit>(),
                entry::<ProcessKill>(),
                entry::<ProcessStop>(),
            ])
        });
        &BUILTIN
    }

    pub fn get(&self, target: &str, fault: &str) -> Result<Box<dyn Injector>> {
        match self.entries.get(&key(target, fault)) {
            Some((_, _, ctor)) => Ok(ctor()),
            None => Err(Error::UnknownFault {
                target: target.to_string(),
                fault: fault.to_string(),
            }),
        }
    }

    pub fn targets(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = self.entries.values().map(|(t, _, _)| *t).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn faults(&self, target: &str) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = self
            .entries
            .values()
            .filter(|(t, _, _)| *t == target)
            .map(|(_, f, _)| *f)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let r = Registry::builtin();
        let inj = r.get("mem", "fill").unwrap();
        assert_eq!(inj.info().target, "mem");
        assert_eq!(inj.info().fault, "fill");

        assert!(matches!(
            r.get("mem", "leak"),
            Err(Error::UnknownFault { .. })
        ));
        assert!(r.get("net", "loss").is_err());
    }

    #[test]
    fn test_targets_and_faults() {
        let r = Registry::builtin();
        assert_eq!(
            r.targets(),
            vec!["container", "cpu", "disk", "diskio", "mem", "process"]
        );
        assert_eq!(r.faults("container"), vec!["kill", "pause", "restart", "rm"]);
        assert_eq!(r.faults("cpu"), vec!["burn"]);
        assert_eq!(r.faults("disk"), vec!["fill"]);
        assert_eq!(r.faults("diskio"), vec!["hang", "limit"]);
        assert!(r.faults("network").is_empty());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_registration_panics() {
        Registry::from_entries([entry::<MemFill>(), entry::<MemFill>()]);
    }

    #[test]
    fn test_fresh_instances() {
        let r = Registry::builtin();
        let mut a = r.get("process", "kill").unwrap();
        a.info_mut().uid = "first".to_string();
        let b = r.get("process", "kill").unwrap();
        assert!(b.info().uid.is_empty());
    }
}
