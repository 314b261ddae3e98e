use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::mail::cache::default_snapshot_path;
use crate::mail::compose::{Composer, DEFAULT_MAX_REFERENCES_LEN, SenderIdentity};
use crate::mail::source::Source;
use crate::mail::transport::SendmailTransport;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub identity: IdentityConfig,
    pub store: StoreConfig,
    pub compose: ComposeConfig,
    pub transport: TransportConfig,
    /// Synced in this order
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Display name used in From: headers
    pub name: String,
    /// Your email address (From: header of replies)
    pub email: String,
    /// Domain for generated Message-IDs (default: domain of `email`)
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Snapshot file (default: <data dir>/git-ew/store.bin)
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    /// Maximum length of the References header value
    pub max_references_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Command to send mail (default: "msmtp -t")
    pub send_command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKindConfig {
    #[default]
    Maildir,
    Mbox,
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKindConfig,
    /// Directory (maildir) or file (mbox)
    pub path: Option<String>,
    /// Archive URL (remote)
    pub url: Option<String>,
    pub enabled: bool,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            max_references_len: DEFAULT_MAX_REFERENCES_LEN,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_command: "msmtp -t".to_string(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: SourceKindConfig::default(),
            path: None,
            url: None,
            enabled: true,
        }
    }
}

impl SourceConfig {
    fn to_source(&self) -> Option<Source> {
        let expanded = || {
            self.path
                .as_deref()
                .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
        };

        match self.kind {
            SourceKindConfig::Maildir => expanded().map(|p| Source::maildir(&self.name, p)),
            SourceKindConfig::Mbox => expanded().map(|p| Source::mbox(&self.name, p)),
            SourceKindConfig::Remote => self
                .url
                .as_deref()
                .map(|url| Source::remote(&self.name, url)),
        }
    }
}

impl Config {
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("git-ew/config.toml"))
            .unwrap_or_else(|| PathBuf::from("~/.config/git-ew/config.toml"))
    }

    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Missing or broken files fall back to the defaults.
    pub fn load_from(config_path: &Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        debug!(path = %config_path.display(), "loaded config");
                        return config;
                    }
                    Err(e) => warn!(path = %config_path.display(), "config parse error: {}", e),
                },
                Err(e) => warn!(path = %config_path.display(), "config read error: {}", e),
            }
        }

        Self::default()
    }

    /// Enabled sources in configured order
    pub fn sources(&self) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .filter_map(|s| {
                let source = s.to_source();
                if source.is_none() {
                    warn!(source = %s.name, "source has no path or url, skipping");
                }
                source
            })
            .collect()
    }

    pub fn snapshot_path(&self) -> Option<PathBuf> {
        match &self.store.path {
            Some(path) => Some(PathBuf::from(shellexpand::tilde(path).into_owned())),
            None => default_snapshot_path(),
        }
    }

    pub fn composer(&self) -> Composer {
        Composer::new(
            SenderIdentity {
                name: self.identity.name.clone(),
                email: self.identity.email.clone(),
                domain: self.identity.domain.clone(),
            },
            self.compose.max_references_len,
        )
    }

    pub fn transport(&self) -> SendmailTransport {
        SendmailTransport::new(self.transport.send_command.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::source::SourceKind;

    const SAMPLE: &str = r#"
[identity]
name = "Ann"
email = "ann@example.org"

[compose]
max_references_len = 200

[[sources]]
name = "lkml"
kind = "mbox"
path = "/srv/lkml.mbox.gz"

[[sources]]
name = "old"
path = "/srv/old"
enabled = false

[[sources]]
name = "lore"
kind = "remote"
url = "https://lore.kernel.org/git"

[[sources]]
name = "broken"
kind = "maildir"
"#;

    #[test]
    fn sources_keep_file_order_and_skip_disabled() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let sources = config.sources();

        let ids: Vec<_> = sources.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["lkml", "lore"]);
        assert_eq!(
            sources[0].kind,
            SourceKind::Mbox {
                path: PathBuf::from("/srv/lkml.mbox.gz")
            }
        );
        assert_eq!(config.compose.max_references_len, 200);
        assert_eq!(config.transport.send_command, "msmtp -t");
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "identity = 3").unwrap();

        let config = Config::load_from(&path);
        assert!(config.sources.is_empty());
        assert_eq!(
            config.compose.max_references_len,
            DEFAULT_MAX_REFERENCES_LEN
        );
        assert!(Config::load_from(&dir.path().join("missing.toml")).identity.email.is_empty());
    }

    #[test]
    fn store_path_is_tilde_expanded() {
        let config: Config = toml::from_str("[store]\npath = \"~/ew/store.bin\"").unwrap();
        let path = config.snapshot_path().unwrap();
        assert!(path.ends_with("ew/store.bin"));
        assert!(!path.starts_with("~"));
    }
}
