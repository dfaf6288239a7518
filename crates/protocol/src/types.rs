use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Mode a data object is opened with, using the server's fopen-style strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "r+")]
    ReadWrite,
    #[serde(rename = "w")]
    Write,
    #[serde(rename = "w+")]
    WriteRead,
    #[serde(rename = "a")]
    Append,
    #[serde(rename = "a+")]
    AppendRead,
}

impl OpenMode {
    /// Returns the wire string for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenMode::Read => "r",
            OpenMode::ReadWrite => "r+",
            OpenMode::Write => "w",
            OpenMode::WriteRead => "w+",
            OpenMode::Append => "a",
            OpenMode::AppendRead => "a+",
        }
    }

    /// Returns `true` if the mode allows writing.
    pub fn is_write(&self) -> bool {
        !matches!(self, OpenMode::Read)
    }

    /// Returns `true` if opening truncates an existing object.
    pub fn truncates(&self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::WriteRead)
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin for a seek request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}

impl Whence {
    /// Returns the numeric code sent on the wire.
    pub fn code(&self) -> i32 {
        match self {
            Whence::Set => 0,
            Whence::Current => 1,
            Whence::End => 2,
        }
    }
}

/// Operation type carried by open requests and resource-server frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    None,
    Put,
    Get,
    Done,
    Other(u32),
}

impl OperationType {
    pub const NONE_CODE: u32 = 0;
    pub const PUT_CODE: u32 = 1;
    pub const GET_CODE: u32 = 2;
    pub const DONE_CODE: u32 = 9999;

    /// Decodes a numeric operation code.
    pub fn from_code(code: u32) -> Self {
        match code {
            Self::NONE_CODE => OperationType::None,
            Self::PUT_CODE => OperationType::Put,
            Self::GET_CODE => OperationType::Get,
            Self::DONE_CODE => OperationType::Done,
            other => OperationType::Other(other),
        }
    }

    /// Returns the numeric operation code.
    pub fn code(&self) -> u32 {
        match self {
            OperationType::None => Self::NONE_CODE,
            OperationType::Put => Self::PUT_CODE,
            OperationType::Get => Self::GET_CODE,
            OperationType::Done => Self::DONE_CODE,
            OperationType::Other(code) => *code,
        }
    }
}

/// An open data-object descriptor on one server connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    /// Server-side L1 descriptor.
    pub descriptor: i32,
    /// Absolute logical path of the data object.
    pub path: String,
    /// Resource the object was opened on.
    pub resource: String,
    pub mode: OpenMode,
}

/// Capability that lets independent connections write into one open replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaAccessToken {
    pub token: String,
    pub resource_hierarchy: String,
}

/// Address and credentials of a resource server a transfer is redirected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectionInfo {
    pub host: String,
    pub port: i32,
    pub cookie: i32,
    pub server_socket: i32,
    pub window_size: i32,
}

impl RedirectionInfo {
    /// Rejects redirection info that cannot be used to dial a resource server.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.host.is_empty() {
            return Err(ProtocolError::InvalidRedirection("empty host".into()));
        }
        if self.port <= 0 {
            return Err(ProtocolError::InvalidRedirection(format!(
                "invalid port {}",
                self.port
            )));
        }
        if self.cookie <= 0 {
            return Err(ProtocolError::InvalidRedirection("empty cookie".into()));
        }
        if self.server_socket <= 0 {
            return Err(ProtocolError::InvalidRedirection(
                "empty server socket".into(),
            ));
        }
        Ok(())
    }

    /// Returns `host:port` suitable for dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-transfer descriptor returned by the catalog when a get/put is requested.
///
/// Must be completed exactly once on the connection that obtained it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectionHandle {
    pub file_descriptor: i32,
    pub path: String,
    pub resource: String,
    pub threads: i32,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub redirection: Option<RedirectionInfo>,
}

impl RedirectionHandle {
    /// Returns the redirection target when the server asked for one.
    ///
    /// `None` means the data should be moved over the catalog connection.
    pub fn redirect_target(&self) -> Option<&RedirectionInfo> {
        if self.threads <= 0 {
            return None;
        }
        self.redirection.as_ref()
    }
}

/// Symmetric cipher negotiated on an SSL control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    #[serde(rename = "AES-256-CBC")]
    Aes256Cbc,
    #[serde(rename = "AES-256-CTR")]
    Aes256Ctr,
    #[serde(rename = "AES-256-CFB")]
    Aes256Cfb,
    #[serde(rename = "AES-256-OFB")]
    Aes256Ofb,
}

impl EncryptionAlgorithm {
    /// Cipher block size in bytes.
    pub fn block_size(&self) -> usize {
        16
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionAlgorithm::Aes256Cbc => "AES-256-CBC",
            EncryptionAlgorithm::Aes256Ctr => "AES-256-CTR",
            EncryptionAlgorithm::Aes256Cfb => "AES-256-CFB",
            EncryptionAlgorithm::Aes256Ofb => "AES-256-OFB",
        }
    }
}

impl FromStr for EncryptionAlgorithm {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AES-256-CBC" => Ok(EncryptionAlgorithm::Aes256Cbc),
            "AES-256-CTR" => Ok(EncryptionAlgorithm::Aes256Ctr),
            "AES-256-CFB" => Ok(EncryptionAlgorithm::Aes256Cfb),
            "AES-256-OFB" => Ok(EncryptionAlgorithm::Aes256Ofb),
            _ => Err(ProtocolError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Encryption parameters negotiated on an SSL control connection.
///
/// Resource-server frames are encrypted with these when present.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionContext {
    pub algorithm: EncryptionAlgorithm,
    /// Key size in bytes; also the IV length carried in frame headers.
    pub key_size: usize,
    pub shared_secret: Vec<u8>,
}

impl fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("algorithm", &self.algorithm)
            .field("key_size", &self.key_size)
            .field("shared_secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> RedirectionInfo {
        RedirectionInfo {
            host: "rs1.example.org".into(),
            port: 20000,
            cookie: 7,
            server_socket: 12,
            window_size: 0,
        }
    }

    #[test]
    fn open_mode_strings() {
        assert_eq!(OpenMode::Read.as_str(), "r");
        assert_eq!(OpenMode::WriteRead.to_string(), "w+");
        assert!(!OpenMode::Read.is_write());
        assert!(OpenMode::Append.is_write());
        assert!(OpenMode::Write.truncates());
        assert!(!OpenMode::ReadWrite.truncates());
    }

    #[test]
    fn operation_type_codes() {
        assert_eq!(OperationType::from_code(2), OperationType::Get);
        assert_eq!(OperationType::from_code(9999), OperationType::Done);
        assert_eq!(OperationType::from_code(42), OperationType::Other(42));
        assert_eq!(OperationType::Put.code(), 1);
        assert_eq!(OperationType::Other(42).code(), 42);
    }

    #[test]
    fn redirection_info_validate() {
        assert!(sample_info().validate().is_ok());

        let mut info = sample_info();
        info.host.clear();
        assert!(info.validate().is_err());

        let mut info = sample_info();
        info.port = 0;
        assert!(info.validate().is_err());

        let mut info = sample_info();
        info.cookie = 0;
        assert!(info.validate().is_err());

        let mut info = sample_info();
        info.server_socket = -1;
        assert!(info.validate().is_err());
    }

    #[test]
    fn redirect_target_requires_threads() {
        let mut handle = RedirectionHandle {
            file_descriptor: 3,
            path: "/zone/home/a.bin".into(),
            resource: "demoResc".into(),
            threads: 4,
            checksum: String::new(),
            redirection: Some(sample_info()),
        };
        assert!(handle.redirect_target().is_some());

        handle.threads = 0;
        assert!(handle.redirect_target().is_none());

        handle.threads = 2;
        handle.redirection = None;
        assert!(handle.redirect_target().is_none());
    }

    #[test]
    fn redirection_handle_json_defaults() {
        let json = r#"{"file_descriptor":3,"path":"/z/a","resource":"r","threads":0}"#;
        let handle: RedirectionHandle = serde_json::from_str(json).unwrap();
        assert!(handle.checksum.is_empty());
        assert!(handle.redirection.is_none());
    }

    #[test]
    fn encryption_algorithm_parse() {
        assert_eq!(
            "aes-256-cbc".parse::<EncryptionAlgorithm>().unwrap(),
            EncryptionAlgorithm::Aes256Cbc
        );
        assert!("DES-256-CBC".parse::<EncryptionAlgorithm>().is_err());
    }

    #[test]
    fn encryption_context_debug_redacts_secret() {
        let ctx = EncryptionContext {
            algorithm: EncryptionAlgorithm::Aes256Cbc,
            key_size: 32,
            shared_secret: vec![0xAA; 32],
        };
        let dbg = format!("{ctx:?}");
        assert!(dbg.contains("redacted"));
        assert!(!dbg.contains("170"));
    }
}
