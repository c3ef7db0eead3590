//! Application configuration.
//!
//! Configuration is loaded from properties-style files: `key = value` lines,
//! `#` comments, and `include <path>` directives that splice another file in
//! place. The synthetic key `CONF_DIR` always holds the parent directory of
//! the loaded file, so values can reference sibling paths.
//!
//! ```text
//! # gantry.properties
//! server.host = 0.0.0.0
//! server.port = 8080
//! include registry
//! ```
//!
//! An `include` value without an extension gets `.properties` appended;
//! relative include paths resolve against the including file's directory.
//! Later assignments win, so a key set after an `include` overrides the
//! included value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tracing::warn;

use crate::errors::{Error, Result};

/// Synthetic key exposing the directory of the loaded properties file.
pub const CONF_DIR: &str = "CONF_DIR";

/// Simple CLI args - just for specifying the config file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "GANTRY_CONFIG", default_value = "gantry.properties")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// A flat `key = value` map parsed from a properties file.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    /// Parse a properties file from disk, following `include` directives.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut props = Properties::default();
        props.load_into(path.as_ref())?;
        Ok(props)
    }

    /// Parse properties from an in-memory string. No `CONF_DIR` is set and
    /// `include` directives resolve against the current directory.
    pub fn parse(text: &str) -> Self {
        let mut props = Properties::default();
        props.absorb(text, Path::new("."));
        props
    }

    fn load_into(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        self.values.insert(CONF_DIR.to_string(), dir.display().to_string());
        self.absorb(&text, &dir);
        Ok(())
    }

    fn absorb(&mut self, text: &str, dir: &Path) {
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            // Values may themselves contain '='; only the first splits.
            let value = value.trim().replace("\\n", "\n");
            if key.is_empty() {
                continue;
            }
            if key == "include" {
                if value.is_empty() {
                    continue;
                }
                let mut target = PathBuf::from(&value);
                if target.extension().is_none() {
                    target.set_extension("properties");
                }
                if target.is_relative() {
                    target = dir.join(target);
                }
                match std::fs::read_to_string(&target) {
                    Ok(sub) => {
                        let sub_dir = target.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
                        self.absorb(&sub, &sub_dir);
                    }
                    Err(err) => warn!(path = %target.display(), %err, "skipping unreadable include"),
                }
                continue;
            }
            self.values.insert(key.to_string(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        self.get(key)?.parse().ok()
    }

    /// Truthy values: `1`, `t`, `T`, `true`, `TRUE`, `True`. Everything
    /// else, including a missing key, is false.
    pub fn bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1" | "t" | "T" | "true" | "TRUE" | "True"))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<'a> IntoIterator for &'a Properties {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::hash_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

/// Typed application configuration derived from a [`Properties`] map.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Emit permissive CORS headers and short-circuit OPTIONS with 202
    pub cross_origin: bool,
    /// Expose the text metrics endpoint at `/metrics`
    pub enable_metrics: bool,
    /// Optional properties bundle with user-facing messages
    pub messages_path: Option<String>,
    /// Pre-shared key required in the `registry-key` header on registration
    pub registry_key: Option<String>,
    /// Peer base URLs for single-hop registration fan-out
    pub registry_peers: Vec<String>,
    /// Expose `GET /_service/endpoints`
    pub registry_query: bool,
    /// Kafka broker list, comma separated
    pub brokers: Option<String>,
    /// Broker dial/produce timeout
    pub broker_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cross_origin: true,
            enable_metrics: true,
            messages_path: None,
            registry_key: None,
            registry_peers: Vec::new(),
            registry_query: true,
            brokers: None,
            broker_timeout: Duration::from_secs(20),
        }
    }
}

impl Config {
    /// Load configuration for the given CLI args. A missing config file is
    /// not an error: defaults apply, matching a bare `gantry` invocation.
    pub fn load(args: &Args) -> Result<Self> {
        if !Path::new(&args.config).exists() {
            warn!(path = %args.config, "config file not found, using defaults");
            return Ok(Config::default());
        }
        let props = Properties::load(&args.config)?;
        Config::from_properties(&props)
    }

    pub fn from_properties(props: &Properties) -> Result<Self> {
        let defaults = Config::default();
        let port = match props.get("server.port") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| Error::bad_request(format!("invalid server.port: {raw}")))?,
            None => defaults.port,
        };
        let registry_peers = props
            .get("registry.peers")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| p.trim_end_matches('/').to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Config {
            host: props.get("server.host").unwrap_or(&defaults.host).to_string(),
            port,
            cross_origin: props.get("server.cross_origin").map(|_| props.bool("server.cross_origin")).unwrap_or(defaults.cross_origin),
            enable_metrics: props.get("metrics.enabled").map(|_| props.bool("metrics.enabled")).unwrap_or(defaults.enable_metrics),
            messages_path: props.get("messages.path").map(str::to_string),
            registry_key: props.get("registry.key").map(str::to_string),
            registry_peers,
            registry_query: props.get("registry.query_enabled").map(|_| props.bool("registry.query_enabled")).unwrap_or(defaults.registry_query),
            brokers: props.get("bus.brokers").map(str::to_string),
            broker_timeout: props
                .int("bus.timeout_seconds")
                .map(|s| Duration::from_secs(s.max(1) as u64))
                .unwrap_or(defaults.broker_timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_comments_blanks_and_values_with_equals() {
        let props = Properties::parse(
            "# a comment\n\
             \n\
             name = gantry\n\
             url = http://host:9092?a=b\n\
             broken line without assignment\n\
             = valueless\n",
        );
        assert_eq!(props.get("name"), Some("gantry"));
        assert_eq!(props.get("url"), Some("http://host:9092?a=b"));
        assert_eq!(props.len(), 2);
    }

    #[test]
    fn unescapes_newlines_in_values() {
        let props = Properties::parse("banner = line one\\nline two\n");
        assert_eq!(props.get("banner"), Some("line one\nline two"));
    }

    #[test]
    fn bool_accepts_the_documented_truthy_spellings() {
        let props = Properties::parse("a = 1\nb = True\nc = f\nd = yes\n");
        assert!(props.bool("a"));
        assert!(props.bool("b"));
        assert!(!props.bool("c"));
        assert!(!props.bool("d"));
        assert!(!props.bool("missing"));
    }

    #[test]
    fn load_sets_conf_dir_and_follows_includes() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("extra.properties");
        std::fs::write(&sub, "registry.key = s3cret\nserver.port = 9000\n").unwrap();

        let main = dir.path().join("main.properties");
        let mut f = std::fs::File::create(&main).unwrap();
        // extension-less include gets .properties appended; later keys win
        writeln!(f, "include extra").unwrap();
        writeln!(f, "server.port = 7000").unwrap();
        drop(f);

        let props = Properties::load(&main).unwrap();
        assert_eq!(props.get(CONF_DIR), Some(dir.path().display().to_string().as_str()));
        assert_eq!(props.get("registry.key"), Some("s3cret"));
        assert_eq!(props.get("server.port"), Some("7000"));
    }

    #[test]
    fn config_from_properties_reads_typed_fields() {
        let props = Properties::parse(
            "server.host = 127.0.0.1\n\
             server.port = 9191\n\
             server.cross_origin = false\n\
             registry.peers = http://a:1/, http://b:2\n\
             bus.timeout_seconds = 5\n",
        );
        let config = Config::from_properties(&props).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9191);
        assert!(!config.cross_origin);
        assert_eq!(config.registry_peers, vec!["http://a:1", "http://b:2"]);
        assert_eq!(config.broker_timeout, Duration::from_secs(5));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let props = Properties::parse("server.port = not-a-port\n");
        assert!(Config::from_properties(&props).is_err());
    }
}
