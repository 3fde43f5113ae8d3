//! `key=value` configuration file and the typed server settings read from it.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::connection::DEFAULT_HIGH_WATER_MARK;
use crate::file_session::TransferSettings;
use crate::poller::PollerKind;
use crate::protocol::{
    BROADBAND_CHUNK, CELLULAR_CHUNK, FrameCodec, HeaderOrder, MAX_PACKAGE_SIZE, RESPONSE_OVERHEAD,
};
use crate::server::ServerOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing config key `{0}`")]
    Missing(&'static str),

    #[error("invalid value {value:?} for `{key}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Ordered `key=value` pairs. `#` starts a comment; the first occurrence of a key wins.
#[derive(Debug, Default, Clone)]
pub struct ConfigReader {
    path: Option<PathBuf>,
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl ConfigReader {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = Self::parse(&text);
        reader.path = Some(path.to_path_buf());
        Ok(reader)
    }

    pub fn parse(text: &str) -> Self {
        let mut reader = Self::default();
        for line in text.lines() {
            let line = match line.find('#') {
                Some(i) => &line[..i],
                None => line,
            };
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() || reader.index.contains_key(key) {
                continue;
            }
            reader.push(key.to_string(), value.trim().to_string());
        }
        reader
    }

    fn push(&mut self, key: String, value: String) {
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|&i| self.entries[i].1.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.index.get(key) {
            Some(&i) => self.entries[i].1 = value.to_string(),
            None => self.push(key.to_string(), value.to_string()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.entries {
            let _ = writeln!(out, "{k}={v}");
        }
        out
    }

    /// Writes the entries back to `path`, or to the file they were loaded from.
    pub fn save(&self, path: Option<&Path>) -> Result<(), ConfigError> {
        let Some(path) = path.or(self.path.as_deref()) else {
            return Err(ConfigError::Io {
                path: PathBuf::new(),
                source: io::Error::new(io::ErrorKind::NotFound, "no path to save to"),
            });
        };
        fs::write(path, self.to_text()).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    pub file_cache_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub log_file: String,
    pub log_level: String,
    pub io_threads: usize,
    /// `None` picks the best backend at startup.
    pub poller: Option<PollerKind>,
    pub reuse_port: bool,
    pub high_water_mark: usize,
    pub header_byte_order: HeaderOrder,
    pub broadband_chunk: usize,
    pub cellular_chunk: usize,
    pub max_package_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            listen_port: 20000,
            file_cache_dir: PathBuf::from("filecache"),
            log_dir: None,
            log_file: "fileserver.log".to_string(),
            log_level: "info".to_string(),
            io_threads: 6,
            poller: None,
            reuse_port: true,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            header_byte_order: HeaderOrder::Little,
            broadband_chunk: BROADBAND_CHUNK,
            cellular_chunk: CELLULAR_CHUNK,
            max_package_size: MAX_PACKAGE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Reads the typed settings. `listen_ip`, `listen_port` and `file_cache_dir` are required.
    pub fn from_reader(reader: &ConfigReader) -> Result<Self, ConfigError> {
        let d = Self::default();
        let poller = match reader.get("poller") {
            None | Some("auto") | Some("") => None,
            Some(_) => parse::<PollerKind>(reader, "poller")?,
        };
        let cfg = Self {
            listen_ip: required(reader, "listen_ip")?,
            listen_port: required(reader, "listen_port")?,
            file_cache_dir: PathBuf::from(require_str(reader, "file_cache_dir")?),
            log_dir: reader.get("log_dir").filter(|s| !s.is_empty()).map(PathBuf::from),
            log_file: reader.get("log_file").map_or(d.log_file, str::to_string),
            log_level: reader.get("log_level").map_or(d.log_level, str::to_string),
            io_threads: parse(reader, "io_threads")?.unwrap_or(d.io_threads),
            poller,
            reuse_port: parse_bool(reader, "reuse_port")?.unwrap_or(d.reuse_port),
            high_water_mark: parse(reader, "high_water_mark")?.unwrap_or(d.high_water_mark),
            header_byte_order: parse(reader, "header_byte_order")?.unwrap_or(d.header_byte_order),
            broadband_chunk: positive(reader, "broadband_chunk")?.unwrap_or(d.broadband_chunk),
            cellular_chunk: positive(reader, "cellular_chunk")?.unwrap_or(d.cellular_chunk),
            max_package_size: positive(reader, "max_package_size")?.unwrap_or(d.max_package_size),
        };
        cfg.check_chunks()?;
        Ok(cfg)
    }

    /// Every download reply must fit in one frame.
    fn check_chunks(&self) -> Result<(), ConfigError> {
        for (key, chunk) in [
            ("broadband_chunk", self.broadband_chunk),
            ("cellular_chunk", self.cellular_chunk),
        ] {
            if chunk.saturating_add(RESPONSE_OVERHEAD) > self.max_package_size {
                return Err(ConfigError::Invalid {
                    key,
                    value: chunk.to_string(),
                    reason: format!(
                        "replies would exceed max_package_size {} ({RESPONSE_OVERHEAD} bytes of framing per reply)",
                        self.max_package_size
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_reader(&ConfigReader::load(path)?)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            reuse_port: self.reuse_port,
            io_threads: self.io_threads,
            poller: self.poller,
            high_water_mark: self.high_water_mark,
        }
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.header_byte_order, self.max_package_size)
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            broadband_chunk: self.broadband_chunk,
            cellular_chunk: self.cellular_chunk,
        }
    }
}

fn require_str<'a>(reader: &'a ConfigReader, key: &'static str) -> Result<&'a str, ConfigError> {
    match reader.get(key) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn required<T>(reader: &ConfigReader, key: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    parse(reader, key)?.ok_or(ConfigError::Missing(key))
}

fn parse<T>(reader: &ConfigReader, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match reader.get(key) {
        None | Some("") => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: v.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn positive(reader: &ConfigReader, key: &'static str) -> Result<Option<usize>, ConfigError> {
    match parse::<usize>(reader, key)? {
        Some(0) => Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        }),
        other => Ok(other),
    }
}

fn parse_bool(reader: &ConfigReader, key: &'static str) -> Result<Option<bool>, ConfigError> {
    match reader.get(key) {
        None | Some("") => Ok(None),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid {
                key,
                value: v.to_string(),
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# file server
listen_ip = 127.0.0.1
listen_port=20000   # trailing comment
file_cache_dir=/tmp/filecache
listen_port=1
poller=poll
header_byte_order=big
not a pair
";

    #[test]
    fn parses_pairs_and_comments() {
        let r = ConfigReader::parse(SAMPLE);
        assert_eq!(r.get("listen_ip"), Some("127.0.0.1"));
        assert_eq!(r.get("listen_port"), Some("20000"));
        assert_eq!(r.get("not a pair"), None);
        assert_eq!(r.get("missing"), None);
    }

    #[test]
    fn typed_view_with_defaults() {
        let cfg = ServerConfig::from_reader(&ConfigReader::parse(SAMPLE)).unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:20000".parse().unwrap());
        assert_eq!(cfg.poller, Some(PollerKind::PollArray));
        assert_eq!(cfg.header_byte_order, HeaderOrder::Big);
        assert_eq!(cfg.io_threads, 6);
        assert!(cfg.reuse_port);
        assert_eq!(cfg.codec().max_body(), MAX_PACKAGE_SIZE);
        assert_eq!(cfg.transfer_settings().broadband_chunk, BROADBAND_CHUNK);
    }

    #[test]
    fn missing_and_invalid_keys() {
        let err = ServerConfig::from_reader(&ConfigReader::parse("listen_ip=127.0.0.1\nlisten_port=1")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("file_cache_dir")));

        let err = ServerConfig::from_reader(&ConfigReader::parse(
            "listen_ip=127.0.0.1\nlisten_port=99999\nfile_cache_dir=x",
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "listen_port", .. }));

        let err = ServerConfig::from_reader(&ConfigReader::parse(
            "listen_ip=127.0.0.1\nlisten_port=1\nfile_cache_dir=x\nreuse_port=maybe",
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "reuse_port", .. }));
    }

    #[test]
    fn chunks_must_fit_in_a_package() {
        let base = "listen_ip=127.0.0.1\nlisten_port=1\nfile_cache_dir=x\n";
        let err = ServerConfig::from_reader(&ConfigReader::parse(&format!(
            "{base}max_package_size=65536\ncellular_chunk=65536\nbroadband_chunk=1024"
        )))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "cellular_chunk", .. }));

        let err = ServerConfig::from_reader(&ConfigReader::parse(&format!("{base}max_package_size=100000")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "broadband_chunk", .. }));

        let fits = 4096 + RESPONSE_OVERHEAD;
        let cfg = ServerConfig::from_reader(&ConfigReader::parse(&format!(
            "{base}max_package_size={fits}\nbroadband_chunk=4096\ncellular_chunk=4096"
        )))
        .unwrap();
        assert_eq!(cfg.codec().max_body(), fits);
    }

    #[test]
    fn set_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.conf");
        fs::write(&path, SAMPLE).unwrap();

        let mut r = ConfigReader::load(&path).unwrap();
        r.set("listen_port", "30000");
        r.set("io_threads", "2");
        r.save(None).unwrap();

        let back = ConfigReader::load(&path).unwrap();
        assert_eq!(back.get("listen_port"), Some("30000"));
        assert_eq!(back.get("io_threads"), Some("2"));
        assert_eq!(back.get("listen_ip"), Some("127.0.0.1"));
    }
}
