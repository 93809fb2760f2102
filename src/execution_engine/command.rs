//! Compiler command lines
//!
//! Translates a task's [`CompilerConfiguration`] into a spawn request using
//! the flag conventions of the target language's compiler family.

use buildsmith_core::models::{CompileTask, OptimizationLevel, TargetLanguage};
use buildsmith_tools::SpawnRequest;

pub fn spawn_request(task: &CompileTask) -> SpawnRequest {
    SpawnRequest::new(&task.config.command)
        .args(compiler_arguments(task))
        .working_dir(&task.working_dir)
        .envs(&task.environment)
}

pub fn compiler_arguments(task: &CompileTask) -> Vec<String> {
    let config = &task.config;
    let mut args = Vec::new();

    match task.language {
        TargetLanguage::C | TargetLanguage::Cpp => {
            args.extend(config.arguments.iter().cloned());
            for path in &config.include_paths {
                args.push(format!("-I{}", path.display()));
            }
            for path in &config.library_paths {
                args.push(format!("-L{}", path.display()));
            }
            for (key, value) in &config.defines {
                if value.is_empty() {
                    args.push(format!("-D{}", key));
                } else {
                    args.push(format!("-D{}={}", key, value));
                }
            }
            args.push(
                match config.optimization {
                    OptimizationLevel::None => "-O0",
                    OptimizationLevel::Basic => "-O1",
                    OptimizationLevel::Aggressive => "-O3",
                }
                .to_string(),
            );
            if config.debug_symbols {
                args.push("-g".to_string());
            }
            if config.warnings_as_errors {
                args.push("-Werror".to_string());
            }
            if let Some(ref output) = config.output_path {
                args.push("-o".to_string());
                args.push(output.display().to_string());
            }
        }
        TargetLanguage::Rust => {
            args.extend(config.arguments.iter().cloned());
            for path in &config.library_paths {
                args.push("-L".to_string());
                args.push(path.display().to_string());
            }
            for (key, value) in &config.defines {
                args.push("--cfg".to_string());
                if value.is_empty() {
                    args.push(key.clone());
                } else {
                    args.push(format!("{}=\"{}\"", key, value));
                }
            }
            args.push("-C".to_string());
            args.push(
                match config.optimization {
                    OptimizationLevel::None => "opt-level=0",
                    OptimizationLevel::Basic => "opt-level=1",
                    OptimizationLevel::Aggressive => "opt-level=3",
                }
                .to_string(),
            );
            if config.debug_symbols {
                args.push("-g".to_string());
            }
            if config.warnings_as_errors {
                args.push("-D".to_string());
                args.push("warnings".to_string());
            }
            if let Some(ref output) = config.output_path {
                args.push("-o".to_string());
                args.push(output.display().to_string());
            }
        }
        TargetLanguage::Go => {
            args.push("build".to_string());
            args.extend(config.arguments.iter().cloned());
            if config.debug_symbols {
                args.push("-gcflags=all=-N -l".to_string());
            }
            if let Some(ref output) = config.output_path {
                args.push("-o".to_string());
                args.push(output.display().to_string());
            }
        }
        TargetLanguage::Java | TargetLanguage::Kotlin => {
            args.extend(config.arguments.iter().cloned());
            if !config.library_paths.is_empty() {
                let classpath = config
                    .library_paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(":");
                args.push("-cp".to_string());
                args.push(classpath);
            }
            if config.debug_symbols && task.language == TargetLanguage::Java {
                args.push("-g".to_string());
            }
            if config.warnings_as_errors {
                args.push("-Werror".to_string());
            }
            if let Some(ref output) = config.output_path {
                args.push("-d".to_string());
                args.push(output.display().to_string());
            }
        }
        TargetLanguage::TypeScript => {
            args.extend(config.arguments.iter().cloned());
            if config.debug_symbols {
                args.push("--sourceMap".to_string());
            }
            if let Some(ref output) = config.output_path {
                args.push("--outDir".to_string());
                args.push(output.display().to_string());
            }
        }
        TargetLanguage::Python | TargetLanguage::JavaScript => {
            args.extend(config.arguments.iter().cloned());
        }
    }

    args.extend(task.source_files.iter().map(|p| p.display().to_string()));
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildsmith_core::models::CompilerConfiguration;
    use std::path::PathBuf;

    #[test]
    fn test_c_flags() {
        let config = CompilerConfiguration::new("clang")
            .with_args(["-std=c11"])
            .with_include_path("include")
            .with_define("NDEBUG", "")
            .with_define("LEVEL", "2")
            .with_optimization(OptimizationLevel::Aggressive)
            .with_debug_symbols(true)
            .with_output_path("out/app");
        let task = CompileTask::new(
            "/proj",
            vec![PathBuf::from("main.c"), PathBuf::from("util.c")],
            TargetLanguage::C,
            config,
        )
        .with_env("CC_LOG", "1");

        assert_eq!(
            compiler_arguments(&task),
            vec![
                "-std=c11", "-Iinclude", "-DLEVEL=2", "-DNDEBUG", "-O3", "-g", "-o", "out/app",
                "main.c", "util.c",
            ]
        );

        let request = spawn_request(&task);
        assert_eq!(request.command, "clang");
        assert_eq!(request.working_dir, Some(PathBuf::from("/proj")));
        assert_eq!(request.env.get("CC_LOG").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_rust_flags() {
        let config = CompilerConfiguration::new("rustc")
            .with_warnings_as_errors(true)
            .with_optimization(OptimizationLevel::Basic);
        let task = CompileTask::new(
            "/proj",
            vec![PathBuf::from("src/main.rs")],
            TargetLanguage::Rust,
            config,
        );

        assert_eq!(
            compiler_arguments(&task),
            vec!["-C", "opt-level=1", "-D", "warnings", "src/main.rs"]
        );
    }
}
