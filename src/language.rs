use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::config::{EntryRule, LanguageConfig};
use crate::error::ConfigError;

/// Artifact name substituted for `%OUTPUT%` when a language declares none
const DEFAULT_ARTIFACT: &str = "main";

/// An opaque subprocess invocation handed to the governor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Everything a strategy may substitute into its commands
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub source_file: &'a str,
    pub entry_name: &'a str,
    pub workspace_dir: &'a Path,
}

/// Pluggable compile/run capability for one language
///
/// The orchestrator only ever sees the commands a strategy produces; it
/// knows nothing about the toolchain behind them.
pub trait LanguageStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Entry symbol derived from the submitted source
    fn entry_name(&self, source: &str) -> String;

    /// File name the source is materialized under
    fn source_file_name(&self, entry_name: &str) -> String;

    /// Build step, if the language has one
    fn compile_command(&self, ctx: &BuildContext<'_>) -> Option<CommandSpec>;

    fn run_command(&self, ctx: &BuildContext<'_>) -> CommandSpec;

    /// File a successful build must leave in the workspace
    fn expected_artifact(&self, _ctx: &BuildContext<'_>) -> Option<String> {
        None
    }

    /// Whether compiler stderr alone fails the build
    fn fail_on_diagnostics(&self) -> bool {
        false
    }
}

/// A language described entirely by command templates from the config file
#[derive(Debug, Clone)]
pub struct TemplateLanguage {
    name: String,
    extension: String,
    entry: EntryRule,
    compile: Option<Vec<String>>,
    run: Vec<String>,
    artifact: Option<String>,
    env: Vec<(String, String)>,
    fail_on_diagnostics: bool,
}

impl TemplateLanguage {
    pub fn new(config: &LanguageConfig) -> Result<Self, ConfigError> {
        if config.run.is_empty() {
            return Err(ConfigError::EmptyRunCommand(config.name.clone()));
        }
        if config.compile.as_ref().is_some_and(Vec::is_empty) {
            return Err(ConfigError::EmptyCompileCommand(config.name.clone()));
        }

        Ok(Self {
            name: config.name.clone(),
            extension: config.extension.trim_start_matches('.').to_string(),
            entry: config.entry.clone(),
            compile: config.compile.clone(),
            run: config.run.clone(),
            artifact: config.artifact.clone(),
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            fail_on_diagnostics: config.fail_on_diagnostics,
        })
    }

    fn artifact_name(&self, ctx: &BuildContext<'_>) -> String {
        match &self.artifact {
            Some(template) => apply_template(template, &placeholders(ctx, DEFAULT_ARTIFACT)),
            None => DEFAULT_ARTIFACT.to_string(),
        }
    }

    fn build_command(&self, template: &[String], ctx: &BuildContext<'_>) -> CommandSpec {
        let artifact = self.artifact_name(ctx);
        let mapping = placeholders(ctx, &artifact);
        let mut parts = template.iter().map(|s| apply_template(s, &mapping));

        CommandSpec {
            // templates are checked non-empty in `new`
            program: parts.next().unwrap_or_default(),
            args: parts.collect(),
            env: self.env.clone(),
        }
    }
}

impl LanguageStrategy for TemplateLanguage {
    fn name(&self) -> &str {
        &self.name
    }

    fn entry_name(&self, source: &str) -> String {
        match &self.entry {
            EntryRule::Fixed { name } => name.clone(),
            EntryRule::Class { fallback } => {
                detect_class_name(source).unwrap_or_else(|| fallback.clone())
            }
        }
    }

    fn source_file_name(&self, entry_name: &str) -> String {
        format!("{entry_name}.{}", self.extension)
    }

    fn compile_command(&self, ctx: &BuildContext<'_>) -> Option<CommandSpec> {
        self.compile
            .as_deref()
            .map(|template| self.build_command(template, ctx))
    }

    fn run_command(&self, ctx: &BuildContext<'_>) -> CommandSpec {
        self.build_command(&self.run, ctx)
    }

    fn expected_artifact(&self, ctx: &BuildContext<'_>) -> Option<String> {
        self.artifact.as_ref().map(|_| self.artifact_name(ctx))
    }

    fn fail_on_diagnostics(&self) -> bool {
        self.fail_on_diagnostics
    }
}

fn placeholders(ctx: &BuildContext<'_>, artifact: &str) -> [(&'static str, String); 4] {
    [
        ("%INPUT%", ctx.source_file.to_string()),
        ("%OUTPUT%", artifact.to_string()),
        ("%ENTRY%", ctx.entry_name.to_string()),
        ("%DIR%", ctx.workspace_dir.to_string_lossy().into_owned()),
    ]
}

/// Replaces every placeholder occurrence in `template`
fn apply_template(template: &str, mapping: &[(&str, String)]) -> String {
    let mut t = template.to_string();
    for (k, v) in mapping {
        t = t.replace(k, v);
    }
    t
}

/// Finds the class a Java-like source must be saved under.
///
/// A public class wins because the compiler insists its file carries that
/// name; otherwise the first declared class is used.
pub fn detect_class_name(source: &str) -> Option<String> {
    static PATTERNS: OnceLock<(Regex, Regex)> = OnceLock::new();
    let (public_class, any_class) = PATTERNS.get_or_init(|| {
        (
            Regex::new(r"\bpublic\s+(?:(?:final|abstract|static)\s+)*class\s+([A-Za-z_$][A-Za-z0-9_$]*)")
                .expect("public class pattern is valid"),
            Regex::new(r"\bclass\s+([A-Za-z_$][A-Za-z0-9_$]*)").expect("class pattern is valid"),
        )
    });

    public_class
        .captures(source)
        .or_else(|| any_class.captures(source))
        .map(|caps| caps[1].to_string())
}

/// Language strategies indexed by lowercase name and alias
#[derive(Default)]
pub struct LanguageRegistry {
    strategies: HashMap<String, Arc<dyn LanguageStrategy>>,
}

impl LanguageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(configs: &[LanguageConfig]) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for config in configs {
            let strategy = Arc::new(TemplateLanguage::new(config)?);
            registry.register(strategy, &config.aliases)?;
        }
        Ok(registry)
    }

    pub fn register(
        &mut self,
        strategy: Arc<dyn LanguageStrategy>,
        aliases: &[String],
    ) -> Result<(), ConfigError> {
        let names = std::iter::once(strategy.name().to_string()).chain(aliases.iter().cloned());
        let keys: Vec<String> = names.map(|n| n.to_lowercase()).collect();

        if let Some(taken) = keys.iter().find(|k| self.strategies.contains_key(*k)) {
            return Err(ConfigError::DuplicateLanguage(taken.clone()));
        }
        for key in keys {
            self.strategies.insert(key, Arc::clone(&strategy));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LanguageStrategy>> {
        self.strategies.get(&name.to_lowercase()).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
