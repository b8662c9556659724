use std::path::PathBuf;

use crate::manifold::gate::Acl;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_WS_PATH: &str = "/ws";
pub const DEFAULT_CIDRS: &str = "0.0.0.0/0,::/0";

/// The raw configuration surface: one field per environment key, exactly as
/// the CLI delivers them.
#[derive(Debug, Clone)]
pub struct RawConfig {
    pub port: u16,
    pub ws_path: String,
    pub token: String,
    pub cidrs: String,
    pub use_tls: bool,
    pub cert_file: String,
    pub key_file: String,
    pub log_level: String,
    pub log_format: String,
    pub log_output: String,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            ws_path: DEFAULT_WS_PATH.into(),
            token: String::new(),
            cidrs: DEFAULT_CIDRS.into(),
            use_tls: false,
            cert_file: String::new(),
            key_file: String::new(),
            log_level: "info".into(),
            log_format: "text".into(),
            log_output: "stderr".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    Stdout,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// An env-filter directive; a bare level name like "info" also works.
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub ws_path: String,
    pub token: String,
    pub acl: Acl,
    pub tls: Option<TlsPaths>,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_raw(raw: RawConfig) -> anyhow::Result<Self> {
        let ws_path = raw.ws_path.trim().to_string();
        if !ws_path.starts_with('/') {
            anyhow::bail!("config: WS_PATH must start with '/' (got {ws_path:?})");
        }

        let cidrs = raw.cidrs.trim();
        let acl = if cidrs.is_empty() {
            Acl::parse(DEFAULT_CIDRS)?
        } else {
            Acl::parse(cidrs)?
        };

        let tls = if raw.use_tls {
            let cert = raw.cert_file.trim();
            let key = raw.key_file.trim();
            if cert.is_empty() || key.is_empty() {
                anyhow::bail!("config: USE_TLS requires CERT_FILE and KEY_FILE");
            }
            Some(TlsPaths {
                cert: PathBuf::from(cert),
                key: PathBuf::from(key),
            })
        } else {
            None
        };

        let level = raw.log_level.trim();
        let level = if level.is_empty() { "info" } else { level };

        let format = match raw.log_format.trim().to_ascii_lowercase().as_str() {
            "" | "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => anyhow::bail!("config: LOG_FORMAT must be text or json (got {other:?})"),
        };

        let output = match raw.log_output.trim() {
            "" | "stderr" => LogOutput::Stderr,
            "stdout" => LogOutput::Stdout,
            path => LogOutput::File(PathBuf::from(path)),
        };

        Ok(Self {
            port: raw.port,
            ws_path,
            token: raw.token.trim().to_string(),
            acl,
            tls,
            logging: LoggingConfig {
                level: level.to_string(),
                format,
                output,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::from_raw(RawConfig::default()).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.ws_path, "/ws");
        assert!(cfg.token.is_empty());
        assert!(cfg.tls.is_none());
        assert!(cfg.acl.permits("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn ws_path_must_be_absolute() {
        let raw = RawConfig {
            ws_path: "ws".into(),
            ..RawConfig::default()
        };
        assert!(Config::from_raw(raw).is_err());
    }

    #[test]
    fn empty_cidrs_falls_back_to_the_default_list() {
        let raw = RawConfig {
            cidrs: "  ".into(),
            ..RawConfig::default()
        };
        let cfg = Config::from_raw(raw).unwrap();
        assert!(cfg.acl.permits("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn tls_requires_both_files() {
        let raw = RawConfig {
            use_tls: true,
            cert_file: "cert.pem".into(),
            ..RawConfig::default()
        };
        assert!(Config::from_raw(raw).is_err());

        let raw = RawConfig {
            use_tls: true,
            cert_file: "cert.pem".into(),
            key_file: "key.pem".into(),
            ..RawConfig::default()
        };
        let cfg = Config::from_raw(raw).unwrap();
        assert_eq!(cfg.tls.unwrap().cert, PathBuf::from("cert.pem"));
    }

    #[test]
    fn token_is_trimmed() {
        let raw = RawConfig {
            token: " secret ".into(),
            ..RawConfig::default()
        };
        assert_eq!(Config::from_raw(raw).unwrap().token, "secret");
    }

    #[test]
    fn log_format_and_output_are_typed() {
        let cfg = Config::from_raw(RawConfig::default()).unwrap();
        assert_eq!(cfg.logging.format, LogFormat::Text);
        assert_eq!(cfg.logging.output, LogOutput::Stderr);
        assert_eq!(cfg.logging.level, "info");

        let raw = RawConfig {
            log_format: "JSON".into(),
            log_output: "/var/log/manifold.log".into(),
            ..RawConfig::default()
        };
        let cfg = Config::from_raw(raw).unwrap();
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(
            cfg.logging.output,
            LogOutput::File("/var/log/manifold.log".into())
        );

        let raw = RawConfig {
            log_format: "xml".into(),
            ..RawConfig::default()
        };
        assert!(Config::from_raw(raw).is_err());
    }

    #[test]
    fn bad_cidrs_fail_loudly() {
        let raw = RawConfig {
            cidrs: "10.0.0.0/8,bogus".into(),
            ..RawConfig::default()
        };
        assert!(Config::from_raw(raw).is_err());
    }
}
