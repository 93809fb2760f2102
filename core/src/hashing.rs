//! Content hashing helpers (SHA-256, lowercase hex)

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;
use crate::models::CompileTask;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash a file's contents
pub async fn hash_file(path: &Path) -> Result<String> {
    let content = tokio::fs::read(path).await?;
    Ok(sha256_hex(&content))
}

/// Hash every source file of a task, in file-list order
///
/// Relative paths resolve against the task's working directory.
pub async fn hash_sources(task: &CompileTask) -> Result<Vec<(String, String)>> {
    let mut hashes = Vec::with_capacity(task.source_files.len());
    for source in &task.source_files {
        let path = if source.is_absolute() {
            source.clone()
        } else {
            task.working_dir.join(source)
        };
        let hash = hash_file(&path).await?;
        hashes.push((source.display().to_string(), hash));
    }
    Ok(hashes)
}

/// Hash of the environment a task ran under: overrides plus working directory
pub fn environment_hash(environment: &BTreeMap<String, String>, working_dir: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(working_dir.display().to_string().as_bytes());
    hasher.update(b"\n");
    for (key, value) in environment {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompilerConfiguration, TargetLanguage};

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_environment_hash_depends_on_values() {
        let mut env = BTreeMap::new();
        env.insert("CC".to_string(), "gcc".to_string());
        let a = environment_hash(&env, Path::new("/work"));
        env.insert("CC".to_string(), "clang".to_string());
        let b = environment_hash(&env, Path::new("/work"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_hash_sources_relative_to_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.c"), "int a;").unwrap();
        let task = CompileTask::new(
            dir.path(),
            vec!["a.c".into()],
            TargetLanguage::C,
            CompilerConfiguration::new("cc"),
        );
        let hashes = hash_sources(&task).await.unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0].1, sha256_hex(b"int a;"));
    }
}
