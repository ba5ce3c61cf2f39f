use anyhow::Result;
use checkpoint::{load_checkpoint, Checkpointer, RegexTranslator, SaveOutcome};
use runtime_core::{CheckpointerConfig, Error, NdArray, StateDict, Value};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use storage::StorageRouter;
use tempfile::TempDir;

/// Write a safetensors file holding f32 tensors and an optional i64 step
fn write_safetensors(path: &Path, tensors: &[(&str, Vec<usize>, Vec<f32>)], step: Option<i64>) {
    let mut header = serde_json::Map::new();
    let mut data = Vec::new();
    for (name, shape, values) in tensors {
        let start = data.len();
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        header.insert(
            name.to_string(),
            json!({ "dtype": "F32", "shape": shape, "data_offsets": [start, data.len()] }),
        );
    }
    if let Some(step) = step {
        let start = data.len();
        data.extend_from_slice(&step.to_le_bytes());
        header.insert(
            "step".to_string(),
            json!({ "dtype": "I64", "shape": [], "data_offsets": [start, data.len()] }),
        );
    }
    header.insert("__metadata__".to_string(), json!({ "format": "pt" }));

    let header = serde_json::to_vec(&header).unwrap();
    let mut file = (header.len() as u64).to_le_bytes().to_vec();
    file.extend_from_slice(&header);
    file.extend_from_slice(&data);
    std::fs::write(path, file).unwrap();
}

fn template() -> StateDict<Value> {
    let mut state = StateDict::new();
    state.insert(
        "target/encoder/kernel",
        Value::Array(NdArray::zeros(runtime_core::DType::F32, vec![2, 2])),
    );
    state.insert(
        "target/encoder/bias",
        Value::Array(NdArray::zeros(runtime_core::DType::F32, vec![2])),
    );
    state
}

fn array(state: &StateDict<Value>, name: &str) -> Vec<f32> {
    state
        .get(name)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("`{}` is not an array", name))
        .to_vec::<f32>()
        .unwrap()
}

#[tokio::test]
async fn test_restore_foreign_with_translator() -> Result<()> {
    let dir = TempDir::new()?;
    let file = dir.path().join("model.safetensors");
    write_safetensors(
        &file,
        &[
            ("encoder.weight", vec![2, 2], vec![1., 2., 3., 4.]),
            ("encoder.bias", vec![2], vec![0.5, 0.5]),
        ],
        Some(1200),
    );

    let checkpointer = Checkpointer::builder(CheckpointerConfig::new(
        dir.path().join("ckpts").to_string_lossy(),
    ))
    .build(template())
    .await?;
    let translator = RegexTranslator::new()
        .rule(r"encoder\.weight", "target/encoder/kernel")
        .rule(r"encoder\.bias", "target/encoder/bias");

    let restored = checkpointer
        .restore_from_foreign_format(&file.to_string_lossy(), true, Some(&translator))
        .await?;
    assert_eq!(restored.step, 1200);
    assert_eq!(array(&restored.state, "target/encoder/kernel"), vec![1., 2., 3., 4.]);
    assert_eq!(array(&restored.state, "target/encoder/bias"), vec![0.5, 0.5]);
    Ok(())
}

#[tokio::test]
async fn test_strict_foreign_restore_rejects_gaps() -> Result<()> {
    let dir = TempDir::new()?;
    let file = dir.path().join("partial.safetensors");
    write_safetensors(
        &file,
        &[("target/encoder/kernel", vec![2, 2], vec![1., 2., 3., 4.])],
        None,
    );
    let checkpointer = Checkpointer::builder(CheckpointerConfig::new(
        dir.path().join("ckpts").to_string_lossy(),
    ))
    .build(template())
    .await?;
    let path = file.to_string_lossy().to_string();

    let strict = checkpointer.restore_from_foreign_format(&path, true, None).await;
    assert!(matches!(strict, Err(Error::NotFound { .. })));

    // lenient restores keep the initial bias
    let lenient = checkpointer.restore_from_foreign_format(&path, false, None).await?;
    assert_eq!(lenient.step, 0);
    assert_eq!(array(&lenient.state, "target/encoder/kernel"), vec![1., 2., 3., 4.]);
    assert_eq!(array(&lenient.state, "target/encoder/bias"), vec![0., 0.]);
    Ok(())
}

#[tokio::test]
async fn test_convert_foreign_to_native() -> Result<()> {
    let dir = TempDir::new()?;
    let file = dir.path().join("export.safetensors");
    write_safetensors(
        &file,
        &[("target/encoder/kernel", vec![2, 2], vec![1., 2., 3., 4.])],
        Some(77),
    );
    let ckpt_dir = dir.path().join("ckpts").to_string_lossy().to_string();
    let checkpointer = Checkpointer::builder(CheckpointerConfig::new(ckpt_dir.clone()))
        .build(template())
        .await?;

    let outcome = checkpointer
        .convert_from_foreign_format(&file.to_string_lossy(), &[])
        .await?;
    assert_eq!(outcome, SaveOutcome::Published { step: 77, deleted: vec![] });

    let loaded = load_checkpoint(
        Arc::new(StorageRouter::local()),
        &ckpt_dir,
        Some(77),
        &[],
        &[],
        None,
        false,
    )
    .await?;
    assert_eq!(loaded.step, 77);
    assert_eq!(array(&loaded.state, "target/encoder/kernel"), vec![1., 2., 3., 4.]);
    Ok(())
}

#[tokio::test]
async fn test_native_manifest_is_not_foreign() -> Result<()> {
    let dir = TempDir::new()?;
    let ckpt_dir = dir.path().join("ckpts").to_string_lossy().to_string();
    let checkpointer = Checkpointer::builder(CheckpointerConfig::new(ckpt_dir.clone()))
        .build(template())
        .await?;
    checkpointer
        .save(&runtime_core::TrainState::new(1, template()), &[], None)
        .await?;

    let manifest = format!("{}/checkpoint_1/checkpoint", ckpt_dir);
    let result = checkpointer.restore_from_foreign_format(&manifest, false, None).await;
    assert!(matches!(result, Err(Error::ForeignFormat { .. })));
    Ok(())
}
