//! Input/output declarations and the change-detection rules.
//!
//! A task declares its files as [`FilePattern`]s. Expansion is eager at
//! execution time, never at registration, so a glob reflects the
//! filesystem as it is when the task is about to run. Freshness is purely
//! mtime-based and stateless between runs. Directories participate exactly
//! like files: a directory's mtime is the inode's own, never computed from
//! its contents.

use std::collections::HashSet;
use std::fs;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::TaskError;

/// One declared input or output element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePattern {
    /// A literal path.
    Path(Utf8PathBuf),
    /// A glob expression, expanded to the matching files sorted by path.
    Glob(String),
    /// An output template containing a single `%`, substituted with the
    /// stem of each concrete input. Only valid as an output.
    Template(String),
}

impl From<&str> for FilePattern {
    fn from(path: &str) -> Self {
        FilePattern::Path(Utf8PathBuf::from(path))
    }
}

impl From<String> for FilePattern {
    fn from(path: String) -> Self {
        FilePattern::Path(Utf8PathBuf::from(path))
    }
}

impl From<Utf8PathBuf> for FilePattern {
    fn from(path: Utf8PathBuf) -> Self {
        FilePattern::Path(path)
    }
}

impl From<&Utf8Path> for FilePattern {
    fn from(path: &Utf8Path) -> Self {
        FilePattern::Path(path.to_path_buf())
    }
}

/// Declares a glob input or output, e.g. `glob("src/*.c")`.
pub fn glob(pattern: impl Into<String>) -> FilePattern {
    FilePattern::Glob(pattern.into())
}

/// Declares a derived output template, e.g. `pattern("obj/%.o")`.
pub fn pattern(template: impl Into<String>) -> FilePattern {
    FilePattern::Template(template.into())
}

/// The classifier's verdict for one task, computed just before its body
/// would run.
#[derive(Debug, Default)]
pub(crate) struct Classified {
    pub inputs: Vec<Utf8PathBuf>,
    pub outputs: Vec<Utf8PathBuf>,
    pub outdated_inputs: Vec<Utf8PathBuf>,
    pub outdated_outputs: Vec<Utf8PathBuf>,
    /// Populated only under the symmetric element-wise pairing rule.
    pub outdated_pairs: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    pub outdated: bool,
}

fn expand_glob(pattern: &str, into: &mut Vec<Utf8PathBuf>) -> Result<(), TaskError> {
    let entries = ::glob::glob(pattern)
        .map_err(|e| TaskError::Pattern(format!("invalid glob \"{pattern}\": {e}")))?;

    let mut matches = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| TaskError::Pattern(format!("glob \"{pattern}\": {e}")))?;
        let path = Utf8PathBuf::try_from(path)
            .map_err(|e| TaskError::Pattern(format!("non-UTF-8 path: {e}")))?;
        matches.push(path);
    }
    matches.sort();
    into.extend(matches);
    Ok(())
}

fn expand_inputs(declared: &[FilePattern]) -> Result<Vec<Utf8PathBuf>, TaskError> {
    let mut expanded = Vec::new();
    for element in declared {
        match element {
            FilePattern::Path(path) => expanded.push(path.clone()),
            FilePattern::Glob(pattern) => expand_glob(pattern, &mut expanded)?,
            FilePattern::Template(template) => {
                return Err(TaskError::Pattern(format!(
                    "derived pattern \"{template}\" is only valid as an output"
                )));
            }
        }
    }
    Ok(dedup(expanded))
}

fn expand_outputs(
    declared: &[FilePattern],
    inputs: &[Utf8PathBuf],
) -> Result<Vec<Utf8PathBuf>, TaskError> {
    let mut expanded = Vec::new();
    for element in declared {
        match element {
            FilePattern::Path(path) => expanded.push(path.clone()),
            FilePattern::Glob(pattern) => expand_glob(pattern, &mut expanded)?,
            FilePattern::Template(template) => {
                if template.matches('%').count() != 1 {
                    return Err(TaskError::Pattern(format!(
                        "derived pattern \"{template}\" must contain exactly one '%'"
                    )));
                }
                for input in inputs {
                    let stem = input.file_stem().unwrap_or(input.as_str());
                    expanded.push(Utf8PathBuf::from(template.replacen('%', stem, 1)));
                }
            }
        }
    }
    Ok(dedup(expanded))
}

fn dedup(paths: Vec<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut seen = HashSet::new();
    paths.into_iter().filter(|p| seen.insert(p.clone())).collect()
}

fn mtime(path: &Utf8Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Expands a task's declarations and decides whether it is out of date.
///
/// Inputs must all exist. Under the symmetric rule (`|inputs| == |outputs|`)
/// each `(input, output)` pair is judged on its own and the outdated views
/// hold exactly the stale pairs; otherwise the task is judged as a whole and
/// the outdated views hold everything.
pub(crate) fn classify(
    declared_inputs: &[FilePattern],
    declared_outputs: &[FilePattern],
) -> Result<Classified, TaskError> {
    let inputs = expand_inputs(declared_inputs)?;
    let outputs = expand_outputs(declared_outputs, &inputs)?;

    for input in &inputs {
        if !input.as_std_path().exists() {
            return Err(TaskError::MissingInput {
                path: input.clone(),
            });
        }
    }

    // A task with no declared i/o at all is phony and always runs.
    if declared_inputs.is_empty() && declared_outputs.is_empty() {
        return Ok(Classified {
            outdated: true,
            ..Classified::default()
        });
    }

    let mut classified = Classified {
        inputs,
        outputs,
        ..Classified::default()
    };

    // Declarations that expanded to nothing on one side leave no pairing to
    // judge; such a task is always out of date.
    if classified.inputs.is_empty() || classified.outputs.is_empty() {
        classified.outdated = true;
        classified.outdated_inputs = classified.inputs.clone();
        classified.outdated_outputs = classified.outputs.clone();
        return Ok(classified);
    }

    if classified.inputs.len() == classified.outputs.len() {
        for (input, output) in classified.inputs.iter().zip(&classified.outputs) {
            let stale = match (mtime(input), mtime(output)) {
                (_, None) => true,
                (Some(i), Some(o)) => i > o,
                // Input existence was checked above; treat a vanished file
                // as stale rather than guessing.
                (None, Some(_)) => true,
            };
            if stale {
                classified.outdated_inputs.push(input.clone());
                classified.outdated_outputs.push(output.clone());
                classified
                    .outdated_pairs
                    .push((input.clone(), output.clone()));
            }
        }
        classified.outdated = !classified.outdated_pairs.is_empty();
    } else {
        let newest_input = classified.inputs.iter().filter_map(|p| mtime(p)).max();
        let mut missing_output = false;
        let mut oldest_output = Option::<SystemTime>::None;
        for output in &classified.outputs {
            match mtime(output) {
                Option::None => missing_output = true,
                Some(t) => {
                    oldest_output = Some(oldest_output.map_or(t, |o| o.min(t)));
                }
            }
        }

        classified.outdated = missing_output
            || matches!((newest_input, oldest_output), (Some(i), Some(o)) if i > o);

        if classified.outdated {
            classified.outdated_inputs = classified.inputs.clone();
            classified.outdated_outputs = classified.outputs.clone();
        }
    }

    Ok(classified)
}
