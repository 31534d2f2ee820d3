//! Stage dependency planning.
//!
//! Stages declare `needs` on other stages; the resulting graph must be a
//! DAG. Scheduling happens in waves: every stage whose dependencies are
//! satisfied runs in the next wave, stages within one wave run
//! concurrently, and a wave only starts after the previous one finished.

use std::collections::HashMap;

use gantry_core::{Error, Result, Stage};

/// Partition stages into dependency waves of indexes into `stages`.
///
/// Fails with a configuration error on duplicate stage names, references
/// to unknown stages, or cycles.
pub(crate) fn waves(stages: &[Stage]) -> Result<Vec<Vec<usize>>> {
    let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(stages.len());
    for (i, stage) in stages.iter().enumerate() {
        if index_of.insert(stage.name.as_str(), i).is_some() {
            return Err(Error::InvalidConfiguration(format!(
                "duplicate stage name: {}",
                stage.name
            )));
        }
    }

    let mut indegree = vec![0usize; stages.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (i, stage) in stages.iter().enumerate() {
        for need in &stage.needs {
            let dep = *index_of.get(need.as_str()).ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "stage {} needs unknown stage {need}",
                    stage.name
                ))
            })?;
            indegree[i] += 1;
            dependents[dep].push(i);
        }
    }

    let mut waves = Vec::new();
    let mut ready: Vec<usize> = (0..stages.len()).filter(|&i| indegree[i] == 0).collect();
    let mut placed = 0;

    while !ready.is_empty() {
        placed += ready.len();
        let mut next = Vec::new();
        for &i in &ready {
            for &dependent in &dependents[i] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        waves.push(std::mem::replace(&mut ready, next));
    }

    if placed != stages.len() {
        return Err(Error::InvalidConfiguration(
            "stage dependency graph contains a cycle".to_string(),
        ));
    }

    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, needs: &[&str]) -> Stage {
        Stage {
            name: name.to_string(),
            needs: needs.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn independent_stages_share_a_wave() {
        let stages = vec![stage("lint", &[]), stage("test", &[])];
        let waves = waves(&stages).unwrap();
        assert_eq!(waves, vec![vec![0, 1]]);
    }

    #[test]
    fn diamond_resolves_in_three_waves() {
        let stages = vec![
            stage("build", &[]),
            stage("test", &["build"]),
            stage("lint", &["build"]),
            stage("deploy", &["test", "lint"]),
        ];
        let waves = waves(&stages).unwrap();
        assert_eq!(waves, vec![vec![0], vec![1, 2], vec![3]]);
    }

    #[test]
    fn cycle_is_a_configuration_error() {
        let stages = vec![stage("a", &["b"]), stage("b", &["a"])];
        let err = waves(&stages).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let stages = vec![stage("a", &["a"])];
        assert!(waves(&stages).is_err());
    }

    #[test]
    fn unknown_need_is_a_configuration_error() {
        let stages = vec![stage("a", &["ghost"])];
        let err = waves(&stages).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let stages = vec![stage("a", &[]), stage("a", &[])];
        assert!(waves(&stages).is_err());
    }
}
