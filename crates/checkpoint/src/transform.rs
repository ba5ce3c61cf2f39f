//! State transformations applied around save and restore
//!
//! Transformations run as ordered chains of plain functions. Save transforms
//! see the state and its parameter infos; restore transforms see the
//! checkpoint's manifest entries, the caller's target state, and whether the
//! restore resumes an interrupted run.

use regex::Regex;
use runtime_core::{Error, Result, StateDict, Value};
use tracing::debug;

use crate::manifest::ManifestEntry;
use crate::param_info::ParameterInfos;

/// `(state, infos) -> (state, infos)`
pub type SaveTransform = Box<
    dyn Fn(StateDict<Value>, ParameterInfos) -> Result<(StateDict<Value>, ParameterInfos)>
        + Send
        + Sync,
>;

/// `(checkpoint entries, target state, is_resuming) -> checkpoint entries`
pub type RestoreTransform = Box<
    dyn Fn(StateDict<ManifestEntry>, &StateDict<Value>, bool) -> Result<StateDict<ManifestEntry>>
        + Send
        + Sync,
>;

pub fn apply_save_transforms(
    mut state: StateDict<Value>,
    mut infos: ParameterInfos,
    transforms: &[SaveTransform],
) -> Result<(StateDict<Value>, ParameterInfos)> {
    for transform in transforms {
        (state, infos) = transform(state, infos)?;
    }
    Ok((state, infos))
}

pub fn apply_restore_transforms(
    mut ckpt: StateDict<ManifestEntry>,
    target: &StateDict<Value>,
    is_resuming: bool,
    transforms: &[RestoreTransform],
) -> Result<StateDict<ManifestEntry>> {
    for transform in transforms {
        ckpt = transform(ckpt, target, is_resuming)?;
    }
    Ok(ckpt)
}

/// Compile `pattern` so it only matches whole keys
fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| Error::invalid_config(format!("bad key pattern `{}`: {}", pattern, e)))
}

/// Rename keys by the first matching `(pattern, replacement)` pair
///
/// Patterns match whole keys; replacements may use `$1`-style groups.
/// Keys matching no pattern are kept as they are.
pub fn rename_keys<T>(state: StateDict<T>, rules: &[(String, String)]) -> Result<StateDict<T>> {
    let compiled = rules
        .iter()
        .map(|(pattern, replacement)| Ok((anchored(pattern)?, replacement.as_str())))
        .collect::<Result<Vec<_>>>()?;

    Ok(state
        .into_iter()
        .map(|(key, value)| {
            match compiled.iter().find(|(pattern, _)| pattern.is_match(&key)) {
                Some((pattern, replacement)) => {
                    let new_key = pattern.replace(&key, *replacement).into_owned();
                    debug!(from = %key, to = %new_key, "Renamed key");
                    (new_key, value)
                }
                None => (key, value),
            }
        })
        .collect())
}

/// Restore transform taking target keys from differently named checkpoint keys
///
/// Each rule is `(target pattern, checkpoint key)`. For every target key the
/// first fully matching rule decides: `Some(replacement)` reads the
/// checkpoint key produced by substituting the match into `replacement`,
/// `None` leaves the key out of the restore. Target keys matching no rule
/// read the checkpoint key of the same name.
pub fn assignment_map(rules: Vec<(String, Option<String>)>) -> Result<RestoreTransform> {
    let compiled = rules
        .into_iter()
        .map(|(pattern, replacement)| Ok((anchored(&pattern)?, replacement)))
        .collect::<Result<Vec<_>>>()?;

    Ok(Box::new(
        move |ckpt: StateDict<ManifestEntry>, target: &StateDict<Value>, _is_resuming: bool| {
            let mut out = StateDict::new();
            for key in target.keys() {
                let rule = compiled.iter().find(|(pattern, _)| pattern.is_match(key));
                let source = match rule {
                    Some((_, None)) => {
                        debug!(key = %key, "Skipping key by assignment map");
                        continue;
                    }
                    Some((pattern, Some(replacement))) => {
                        pattern.replace(key, replacement.as_str()).into_owned()
                    }
                    None => key.clone(),
                };
                if let Some(entry) = ckpt.get(&source) {
                    out.insert(key.clone(), entry.clone());
                }
            }
            Ok(out)
        },
    ))
}
