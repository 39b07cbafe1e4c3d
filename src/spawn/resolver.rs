// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent type resolution.
//!
//! A type is either built into the binary (registered workers) or an
//! external program configured under `workers`. Anything else is refused.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::config::WorkerProgram;
use crate::error::SpawnError;

/// How an agent type is implemented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedWorker {
    /// Compiled into the agent binary.
    Builtin(String),
    /// External program run by the agent on every work cycle.
    External(WorkerProgram),
}

#[derive(Debug, Clone, Default)]
pub struct WorkerResolver {
    builtin: BTreeSet<String>,
    external: BTreeMap<String, WorkerProgram>,
}

impl WorkerResolver {
    pub fn new<I, S>(builtin: I, external: BTreeMap<String, WorkerProgram>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            builtin: builtin.into_iter().map(Into::into).collect(),
            external,
        }
    }

    /// Every type this resolver knows about.
    pub fn known_types(&self) -> Vec<String> {
        self.builtin
            .iter()
            .chain(self.external.keys())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Resolve `agent_type`, checking that an external program exists.
    pub fn resolve(&self, agent_type: &str) -> Result<ResolvedWorker, SpawnError> {
        if let Some(program) = self.external.get(agent_type) {
            let path = locate_program(&program.program)
                .ok_or_else(|| SpawnError::ImplementationMissing(program.program.clone()))?;
            return Ok(ResolvedWorker::External(WorkerProgram {
                program: path.display().to_string(),
                args: program.args.clone(),
            }));
        }
        if self.builtin.contains(agent_type) {
            return Ok(ResolvedWorker::Builtin(agent_type.to_string()));
        }
        Err(SpawnError::UnknownAgentType(agent_type.to_string()))
    }
}

/// Find `program` as a path, or on `PATH` when it is a bare name.
pub fn locate_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if program.contains(std::path::MAIN_SEPARATOR) || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resolver(temp: &TempDir) -> WorkerResolver {
        let script = temp.path().join("scraper.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        let mut external = BTreeMap::new();
        external.insert(
            "scraper".to_string(),
            WorkerProgram {
                program: script.display().to_string(),
                args: vec!["--once".to_string()],
            },
        );
        external.insert(
            "missing".to_string(),
            WorkerProgram {
                program: temp.path().join("nope").display().to_string(),
                args: vec![],
            },
        );
        WorkerResolver::new(["orchestrator", "supervisor"], external)
    }

    #[test]
    fn test_builtin_and_external() {
        let temp = TempDir::new().unwrap();
        let resolver = resolver(&temp);
        assert_eq!(
            resolver.resolve("supervisor").unwrap(),
            ResolvedWorker::Builtin("supervisor".to_string())
        );
        match resolver.resolve("scraper").unwrap() {
            ResolvedWorker::External(p) => assert_eq!(p.args, vec!["--once".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_hard_error() {
        let temp = TempDir::new().unwrap();
        let err = resolver(&temp).resolve("redis_watchdog").unwrap_err();
        assert!(matches!(err, SpawnError::UnknownAgentType(t) if t == "redis_watchdog"));
    }

    #[test]
    fn test_missing_program_is_hard_error() {
        let temp = TempDir::new().unwrap();
        let err = resolver(&temp).resolve("missing").unwrap_err();
        assert!(matches!(err, SpawnError::ImplementationMissing(_)));
    }

    #[test]
    fn test_known_types() {
        let temp = TempDir::new().unwrap();
        assert_eq!(
            resolver(&temp).known_types(),
            vec!["missing", "orchestrator", "scraper", "supervisor"]
        );
    }
}
