//! Project and user configuration.
//!
//! The project file (`tplbuild.yml`) describes profiles, platforms, build
//! contexts, and stage overrides. The user file (`~/.tplbuildconfig.yml`)
//! selects the builder client and registry transport options. Both are
//! strict-parsed YAML; unknown keys are rejected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TplError};

/// Free-form template variables attached to a profile.
pub type ProfileVars = BTreeMap<String, serde_yaml::Value>;

/// Configuration for a single named build context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ContextConfig {
    /// Base directory of the context, relative to the project directory.
    pub base_dir: String,
    /// Umask as an octal string. `null` passes raw permission bits
    /// through; the default keeps base image hashes stable across
    /// developers with differing group/other bits.
    pub umask: Option<String>,
    /// File to load ignore patterns from; defaults to `.dockerignore`
    /// when neither this nor `ignore` is set.
    pub ignore_file: Option<String>,
    /// Inline ignore patterns, used over `ignore_file` when present.
    pub ignore: Option<Vec<String>>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            base_dir: ".".to_string(),
            umask: Some("022".to_string()),
            ignore_file: None,
            ignore: None,
        }
    }
}

impl ContextConfig {
    /// The umask parsed as octal mode bits.
    pub fn umask_bits(&self) -> Result<Option<u32>> {
        match &self.umask {
            None => Ok(None),
            Some(text) => {
                let bits = u32::from_str_radix(text, 8)
                    .map_err(|_| TplError::config(format!("invalid umask {text:?}")))?;
                if bits > 0o777 {
                    return Err(TplError::config(format!("umask {text:?} out of range")));
                }
                Ok(Some(bits))
            }
        }
    }
}

/// Per-stage configuration overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StageConfig {
    /// Explicitly mark (or unmark) the stage as a base image. When set
    /// this overrides the `base-`/`base_` name prefix.
    pub base: Option<bool>,
    /// Image name templates applied to the built stage. Defaults to the
    /// project `stage_image_name` template.
    pub image_names: Option<Vec<String>>,
    /// Image name templates pushed when publishing. Defaults to the
    /// project `stage_push_name` template.
    pub push_names: Option<Vec<String>>,
}

/// Project configuration loaded from `tplbuild.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TplConfig {
    pub version: String,
    /// Template rendering to the repository where base images are cached.
    /// Required when any base stage exists.
    pub base_image_repo: Option<String>,
    /// Template for the default image name of a stage.
    pub stage_image_name: String,
    /// Template for the default push name of a stage.
    pub stage_push_name: String,
    /// Dockerfile `syntax` directive forwarded to builders that honor it.
    pub dockerfile_syntax: String,
    /// Platforms to build base images for.
    pub platforms: Vec<String>,
    /// Name of the default profile; empty selects the first profile.
    pub default_profile: String,
    pub profiles: BTreeMap<String, ProfileVars>,
    pub contexts: BTreeMap<String, ContextConfig>,
    pub stages: BTreeMap<String, StageConfig>,
    /// Search directories for included templates.
    pub template_paths: Vec<String>,
    /// Template rendered to produce the build stages.
    pub template_entrypoint: String,
}

impl Default for TplConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            base_image_repo: None,
            stage_image_name: "{{ stage_name }}".to_string(),
            stage_push_name: "{{ stage_name }}".to_string(),
            dockerfile_syntax: String::new(),
            platforms: vec!["linux/amd64".to_string()],
            default_profile: String::new(),
            profiles: BTreeMap::from([("default".to_string(), ProfileVars::new())]),
            contexts: BTreeMap::from([("default".to_string(), ContextConfig::default())]),
            stages: BTreeMap::new(),
            template_paths: vec![".".to_string()],
            template_entrypoint: "Dockerfile".to_string(),
        }
    }
}

impl TplConfig {
    /// Load the project config from `<base_dir>/tplbuild.yml`. A missing
    /// file yields the default configuration.
    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join("tplbuild.yml");
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(err) => return Err(TplError::io(path, err)),
        };
        let config: Self = serde_yaml::from_str(&text)
            .map_err(|err| TplError::config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != "1.0" {
            return Err(TplError::config(format!(
                "unsupported project config version {:?}",
                self.version
            )));
        }
        if self.platforms.is_empty() {
            return Err(TplError::config("platforms cannot be empty"));
        }
        if self.profiles.is_empty() {
            return Err(TplError::config("profiles cannot be empty"));
        }
        if self.profiles.keys().any(|name| name.is_empty()) {
            return Err(TplError::config("profile name cannot be empty"));
        }
        if !self.default_profile.is_empty() && !self.profiles.contains_key(&self.default_profile) {
            return Err(TplError::config(format!(
                "default_profile {:?} is not a configured profile",
                self.default_profile
            )));
        }
        for (name, context) in &self.contexts {
            context.umask_bits().map_err(|err| {
                TplError::config(format!("context {name:?}: {err}"))
            })?;
            if context.ignore.is_some() && context.ignore_file.is_some() {
                return Err(TplError::config(format!(
                    "context {name:?}: ignore and ignore_file are mutually exclusive"
                )));
            }
        }
        for (name, stage) in &self.stages {
            if stage.base == Some(true)
                && (stage.image_names.is_some() || stage.push_names.is_some())
            {
                return Err(TplError::config(format!(
                    "stage {name:?}: base stages cannot set image_names or push_names"
                )));
            }
        }
        Ok(())
    }

    /// The profile selected when none is given on the command line.
    pub fn default_profile_name(&self) -> &str {
        if !self.default_profile.is_empty() {
            return &self.default_profile;
        }
        self.profiles
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or("default")
    }

    /// Variables of the named profile.
    pub fn profile_vars(&self, profile: &str) -> Result<&ProfileVars> {
        self.profiles
            .get(profile)
            .ok_or_else(|| TplError::config(format!("profile {profile:?} does not exist")))
    }
}

/// Supported builder client families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Docker,
    Buildx,
    Podman,
    Custom,
}

/// One builder operation as an argv template plus environment overrides.
///
/// Recognised placeholders are `{image}`, `{source_image}`,
/// `{target_image}`, and `{platform}`, substituted per argv element; an
/// element whose placeholder expands empty is dropped entirely so
/// optional arguments like `--platform={platform}` disappear cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientCommand {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ClientCommand {
    pub fn new(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    /// Expand the argv template against the given parameters.
    pub fn expand(&self, params: &BTreeMap<&str, &str>) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len());
        'elements: for element in &self.args {
            let mut expanded = element.clone();
            for (key, value) in params {
                let placeholder = format!("{{{key}}}");
                if expanded.contains(&placeholder) {
                    if value.is_empty() {
                        continue 'elements;
                    }
                    expanded = expanded.replace(&placeholder, value);
                }
            }
            argv.push(expanded);
        }
        argv
    }
}

/// The full builder command table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientCommands {
    pub build: ClientCommand,
    pub tag: ClientCommand,
    pub push: ClientCommand,
    #[serde(default)]
    pub pull: Option<ClientCommand>,
    pub untag: ClientCommand,
    /// Prints the client's default `os/arch` platform; the local platform
    /// is used when absent.
    #[serde(default)]
    pub platform: Option<ClientCommand>,
}

/// Built-in command tables for the known client families.
pub fn builtin_commands(client_type: ClientType) -> Option<ClientCommands> {
    match client_type {
        ClientType::Docker => Some(ClientCommands {
            build: ClientCommand::new(&[
                "docker",
                "build",
                "--platform={platform}",
                "--tag={image}",
                "-",
            ]),
            tag: ClientCommand::new(&["docker", "tag", "{source_image}", "{target_image}"]),
            push: ClientCommand::new(&["docker", "push", "{image}"]),
            pull: Some(ClientCommand::new(&["docker", "pull", "{image}"])),
            untag: ClientCommand::new(&["docker", "rmi", "{image}"]),
            platform: Some(ClientCommand::new(&[
                "docker",
                "system",
                "info",
                "--format",
                "{{.OSType}}/{{.Architecture}}",
            ])),
        }),
        ClientType::Buildx => Some(ClientCommands {
            build: ClientCommand::new(&[
                "docker",
                "buildx",
                "build",
                "--platform={platform}",
                "--tag={image}",
                "--load",
                "-",
            ]),
            tag: ClientCommand::new(&["docker", "tag", "{source_image}", "{target_image}"]),
            push: ClientCommand::new(&["docker", "push", "{image}"]),
            pull: Some(ClientCommand::new(&["docker", "pull", "{image}"])),
            untag: ClientCommand::new(&["docker", "rmi", "{image}"]),
            platform: Some(ClientCommand::new(&[
                "docker",
                "system",
                "info",
                "--format",
                "{{.OSType}}/{{.Architecture}}",
            ])),
        }),
        ClientType::Podman => Some(ClientCommands {
            build: ClientCommand::new(&[
                "podman",
                "build",
                "--platform={platform}",
                "--tag={image}",
                "-",
            ]),
            tag: ClientCommand::new(&["podman", "tag", "{source_image}", "{target_image}"]),
            push: ClientCommand::new(&["podman", "push", "{image}"]),
            pull: Some(ClientCommand::new(&["podman", "pull", "{image}"])),
            untag: ClientCommand::new(&["podman", "rmi", "{image}"]),
            platform: Some(ClientCommand::new(&[
                "podman",
                "info",
                "--format",
                "{{.Version.OsArch}}",
            ])),
        }),
        ClientType::Custom => None,
    }
}

/// Builder client selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClientSection {
    #[serde(rename = "type")]
    pub client_type: ClientType,
    /// Command table for `type: custom`, or overrides for a builtin.
    pub commands: Option<ClientCommands>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            client_type: ClientType::Docker,
            commands: None,
        }
    }
}

/// Per-registry TLS trust options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SslContextConfig {
    /// Disable server certificate verification.
    pub insecure: bool,
    /// Path of a PEM file with additional CA certificates to trust.
    pub cafile: Option<String>,
    /// Directory of PEM files with additional CA certificates to trust.
    pub capath: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RegistrySection {
    pub ssl_context: SslContextConfig,
}

/// User settings loaded from `~/.tplbuildconfig.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UserConfig {
    pub version: String,
    pub client: ClientSection,
    pub registry: RegistrySection,
    /// Maximum concurrent builder invocations; 0 selects the CPU count.
    pub parallelism: usize,
    /// Path of a Docker-style credential config; the default search path
    /// is used when unset.
    pub auth: Option<String>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            client: ClientSection::default(),
            registry: RegistrySection::default(),
            parallelism: 0,
            auth: None,
        }
    }
}

impl UserConfig {
    /// Load the user config from its default location. A missing file
    /// yields the default configuration.
    pub fn load() -> Result<Self> {
        match dirs::home_dir() {
            Some(home) => Self::load_from(&home.join(".tplbuildconfig.yml")),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => return Err(TplError::io(path, err)),
        };
        let config: Self = serde_yaml::from_str(&text)
            .map_err(|err| TplError::config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != "1.0" {
            return Err(TplError::config(format!(
                "unsupported user config version {:?}",
                self.version
            )));
        }
        if self.client.client_type == ClientType::Custom && self.client.commands.is_none() {
            return Err(TplError::config(
                "client type \"custom\" requires a commands table",
            ));
        }
        Ok(())
    }

    /// The effective builder command table: explicit commands win, then
    /// the builtin table for the selected client type.
    pub fn client_commands(&self) -> Result<ClientCommands> {
        if let Some(commands) = &self.client.commands {
            return Ok(commands.clone());
        }
        builtin_commands(self.client.client_type)
            .ok_or_else(|| TplError::config("client type \"custom\" requires a commands table"))
    }

    /// Bound on concurrent builder invocations.
    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism > 0 {
            return self.parallelism;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    /// Path of the Docker credential config to use, if one exists.
    pub fn auth_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.auth {
            return Some(PathBuf::from(path));
        }
        let default = dirs::home_dir()?.join(".docker/config.json");
        default.exists().then_some(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_defaults() {
        let config = TplConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_profile_name(), "default");
        assert_eq!(config.platforms, vec!["linux/amd64"]);
        assert!(config.contexts.contains_key("default"));
    }

    #[test]
    fn test_project_yaml_round_trip() {
        let text = "\
version: \"1.0\"
base_image_repo: registry.example.com/team/bases
platforms: [linux/amd64, linux/arm64]
default_profile: dev
profiles:
  dev:
    debug: true
  release: {}
contexts:
  default:
    base_dir: .
    ignore:
      - \"*.log\"
stages:
  base-deps:
    base: true
  app:
    push_names: [\"msg555/app:v1\"]
";
        let config: TplConfig = serde_yaml::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.default_profile_name(), "dev");
        assert_eq!(config.stages["base-deps"].base, Some(true));
        assert_eq!(
            config.contexts["default"].ignore.as_deref(),
            Some(&["*.log".to_string()][..])
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: std::result::Result<TplConfig, _> =
            serde_yaml::from_str("version: \"1.0\"\nbogus_key: 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_umask_rejected() {
        let mut config = TplConfig::default();
        config
            .contexts
            .insert("default".into(), ContextConfig {
                umask: Some("9z".into()),
                ..Default::default()
            });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_base_stage_with_image_names_rejected() {
        let mut config = TplConfig::default();
        config.stages.insert(
            "base-deps".into(),
            StageConfig {
                base: Some(true),
                image_names: Some(vec!["x".into()]),
                push_names: None,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_default_profile_rejected() {
        let mut config = TplConfig::default();
        config.default_profile = "nope".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_command_expand() {
        let command = ClientCommand::new(&[
            "docker",
            "build",
            "--platform={platform}",
            "--tag={image}",
            "-",
        ]);
        let mut params = BTreeMap::new();
        params.insert("image", "app:latest");
        params.insert("platform", "linux/amd64");
        assert_eq!(
            command.expand(&params),
            vec!["docker", "build", "--platform=linux/amd64", "--tag=app:latest", "-"]
        );

        // Empty parameters drop their argv element entirely.
        params.insert("platform", "");
        assert_eq!(
            command.expand(&params),
            vec!["docker", "build", "--tag=app:latest", "-"]
        );
    }

    #[test]
    fn test_expand_leaves_go_templates_alone() {
        let command = ClientCommand::new(&["docker", "info", "--format", "{{.OSType}}"]);
        assert_eq!(
            command.expand(&BTreeMap::new()),
            vec!["docker", "info", "--format", "{{.OSType}}"]
        );
    }

    #[test]
    fn test_custom_client_requires_commands() {
        let config: UserConfig = serde_yaml::from_str("client:\n  type: custom\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builtin_client_tables() {
        for client_type in [ClientType::Docker, ClientType::Buildx, ClientType::Podman] {
            let commands = builtin_commands(client_type).unwrap();
            assert_eq!(commands.build.args.last().map(String::as_str), Some("-"));
            assert!(commands.platform.is_some());
        }
        assert!(builtin_commands(ClientType::Custom).is_none());
    }
}
