//! Known toolchains and how to install them

use buildsmith_core::config::ToolchainSettings;
use buildsmith_core::error::{BuildsmithError, Result};
use buildsmith_core::models::TargetLanguage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+\.\d+(?:\.\d+)?").unwrap_or_else(|err| panic!("invalid VERSION regex: {err}"))
});

/// A command line to run through the process spawner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Everything the manager knows about one language's toolchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainDefinition {
    pub language: TargetLanguage,
    pub name: String,
    pub install: CommandSpec,
    pub uninstall: Option<CommandSpec>,
    /// Prints the installed version; exit 0 means present
    pub probe: Option<CommandSpec>,
    pub latest_version: String,
    pub capabilities: Vec<String>,
}

impl ToolchainDefinition {
    fn package(
        language: TargetLanguage,
        name: &str,
        package: &str,
        probe: CommandSpec,
        latest_version: &str,
        capabilities: &[&str],
    ) -> Self {
        Self {
            language,
            name: name.to_string(),
            install: CommandSpec::new("pkg", &["install", "-y", package]),
            uninstall: Some(CommandSpec::new("pkg", &["uninstall", "-y", package])),
            probe: Some(probe),
            latest_version: latest_version.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolchainRegistry {
    definitions: BTreeMap<TargetLanguage, ToolchainDefinition>,
}

impl ToolchainRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Package-manager based definitions for every supported language
    pub fn builtin() -> Self {
        use TargetLanguage::*;

        let mut registry = Self::empty();
        registry.register(ToolchainDefinition::package(
            C,
            "clang",
            "clang",
            CommandSpec::new("clang", &["--version"]),
            "18.1.8",
            &["compile", "link", "debug-symbols", "optimize"],
        ));
        registry.register(ToolchainDefinition::package(
            Cpp,
            "clang++",
            "clang",
            CommandSpec::new("clang++", &["--version"]),
            "18.1.8",
            &["compile", "link", "debug-symbols", "optimize"],
        ));
        registry.register(ToolchainDefinition {
            language: Rust,
            name: "rustc".to_string(),
            install: CommandSpec::new("rustup", &["toolchain", "install", "stable"]),
            uninstall: Some(CommandSpec::new("rustup", &["toolchain", "uninstall", "stable"])),
            probe: Some(CommandSpec::new("rustc", &["--version"])),
            latest_version: "1.82.0".to_string(),
            capabilities: ["compile", "link", "debug-symbols", "optimize", "incremental"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
        });
        registry.register(ToolchainDefinition::package(
            Go,
            "go",
            "golang",
            CommandSpec::new("go", &["version"]),
            "1.23.2",
            &["compile", "link"],
        ));
        registry.register(ToolchainDefinition::package(
            Java,
            "javac",
            "openjdk-21",
            CommandSpec::new("javac", &["-version"]),
            "21.0.5",
            &["compile", "debug-symbols"],
        ));
        registry.register(ToolchainDefinition::package(
            Kotlin,
            "kotlinc",
            "kotlin",
            CommandSpec::new("kotlinc", &["-version"]),
            "2.0.21",
            &["compile"],
        ));
        registry.register(ToolchainDefinition::package(
            Python,
            "python",
            "python",
            CommandSpec::new("python3", &["--version"]),
            "3.12.7",
            &["bytecode"],
        ));
        registry.register(ToolchainDefinition::package(
            JavaScript,
            "node",
            "nodejs",
            CommandSpec::new("node", &["--version"]),
            "22.11.0",
            &["syntax-check"],
        ));
        registry.register(ToolchainDefinition {
            language: TypeScript,
            name: "tsc".to_string(),
            install: CommandSpec::new("npm", &["install", "-g", "typescript"]),
            uninstall: Some(CommandSpec::new("npm", &["uninstall", "-g", "typescript"])),
            probe: Some(CommandSpec::new("tsc", &["--version"])),
            latest_version: "5.6.3".to_string(),
            capabilities: vec!["compile".to_string(), "type-check".to_string()],
        });
        registry
    }

    pub fn register(&mut self, definition: ToolchainDefinition) {
        self.definitions.insert(definition.language, definition);
    }

    pub fn get(&self, language: TargetLanguage) -> Option<&ToolchainDefinition> {
        self.definitions.get(&language)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ToolchainDefinition> {
        self.definitions.values()
    }

    /// Replace installer commands from configuration
    pub fn apply_overrides(&mut self, settings: &ToolchainSettings) -> Result<()> {
        for (name, installer) in &settings.installers {
            let language: TargetLanguage = name.parse().map_err(|_| {
                BuildsmithError::Config(format!("Unknown language in toolchain overrides: {}", name))
            })?;
            let definition = self
                .definitions
                .entry(language)
                .or_insert_with(|| ToolchainDefinition {
                    language,
                    name: installer.command.clone(),
                    install: CommandSpec::new(&installer.command, &[]),
                    uninstall: None,
                    probe: None,
                    latest_version: String::new(),
                    capabilities: vec!["compile".to_string()],
                });
            definition.install = CommandSpec {
                command: installer.command.clone(),
                args: installer.args.clone(),
            };
            if let Some(ref version) = installer.version {
                definition.latest_version = version.clone();
            }
        }
        Ok(())
    }
}

/// First `major.minor[.patch]` found in tool output
pub fn extract_version(text: &str) -> Option<String> {
    VERSION.find(text).map(|m| m.as_str().to_string())
}

/// Compare dotted numeric versions; missing components count as zero
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split(|c: char| c == '.' || c == '-')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ordering = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
