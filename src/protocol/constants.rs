//! Descriptor names, command catalog and wire constants shared verbatim by
//! both ends of a connection.

use crate::error::DStoreError;
use std::fmt;
use std::str::FromStr;

// Element types
pub const MESSAGE_DESCRIPTOR: &str = "universal.message";
pub const UNIVERSAL_NODE_DESCRIPTOR: &str = "universal.node";
pub const UNIVERSAL_TEMP_DESCRIPTOR: &str = "universal.temp";
pub const UNIVERSAL_FILTER_DESCRIPTOR: &str = "universal.FilterObject";
pub const UNIVERSAL_FILE_DESCRIPTOR: &str = "universal.FileObject";
pub const UNIVERSAL_FOLDER_DESCRIPTOR: &str = "universal.FolderObject";
pub const STATUS_TYPE: &str = "status";
pub const COMMAND_TYPE: &str = "command";
pub const ARGUMENT_TYPE: &str = "argument";
pub const ENVIRONMENT_TYPE: &str = "environment";
pub const DIRECTORY_TYPE: &str = "directory";
pub const FLAG_TYPE: &str = "flag";
pub const ERROR_TYPE: &str = "error";
pub const STDOUT_TYPE: &str = "stdout";
pub const STDERR_TYPE: &str = "stderr";
pub const EXIT_CODE_TYPE: &str = "exit";
pub const PROCESS_TYPE: &str = "process";
pub const MINER_TYPE: &str = "miner";
pub const ENVIRONMENT_VARIABLE_TYPE: &str = "Environment Variable";
pub const SYSTEM_ENVIRONMENT_NAME: &str = "System Environment";
pub const PROPERTY_TYPE: &str = "property";
pub const SEARCH_RESULT_TYPE: &str = "universal.searchResult";
pub const TYPE_QUALIFIED_CLASSNAME: &str = "fullClassName";

// Miner ids
pub const UNIVERSAL_FILESYSTEM_MINER: &str = "UniversalFileSystemMiner";
pub const COMMAND_MINER: &str = "CommandMiner";
pub const ENVIRONMENT_MINER: &str = "EnvironmentMiner";
pub const PROCESS_MINER: &str = "UniversalProcessMiner";

// Download result types and messages
pub const DOWNLOAD_RESULT_SUCCESS_TYPE: &str = "universal.download.success";
pub const DOWNLOAD_RESULT_SUCCESS_MESSAGE: &str = "successful";
pub const DOWNLOAD_RESULT_FILE_NOT_FOUND_EXCEPTION: &str = "FileNotFoundException";
pub const DOWNLOAD_RESULT_UNSUPPORTED_ENCODING_EXCEPTION: &str = "UnsupportedEncodingException";
pub const DOWNLOAD_RESULT_IO_EXCEPTION: &str = "IOException";
pub const DOWNLOAD_RESULT_EXCEPTION: &str = "Exception";
pub const DOWNLOAD_RESULT_UNEXPECTED_ERROR: &str = "UnexpectedError";

// Transfer modes
pub const TEXT_MODE: i32 = -1;
pub const BINARY_MODE: i32 = -2;

pub const KB_IN_BYTES: usize = 1024;
pub const NUM_OF_KB: usize = 10;
/// Size of the file segments read and sent across the connection.
pub const BUFFER_SIZE: usize = NUM_OF_KB * KB_IN_BYTES;

// Command channel tags
pub const PROTO_OK: u8 = 0;
pub const PROTO_COMMAND: u8 = 1;
pub const PROTO_SHUTDOWN: u8 = 2;
pub const PROTO_ERROR: u8 = 126;

pub const CMD_EXEC: u16 = 1;

/// Expected argument count of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    pub fn accepts(&self, count: usize) -> bool {
        match *self {
            Arity::Exact(n) => count == n,
            Arity::AtLeast(n) => count >= n,
            Arity::Between(lo, hi) => count >= lo && count <= hi,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "exactly {}", n),
            Arity::AtLeast(n) => write!(f, "at least {}", n),
            Arity::Between(lo, hi) => write!(f, "between {} and {}", lo, hi),
        }
    }
}

macro_rules! command_catalog {
    ($($variant:ident => $name:literal, $arity:expr;)*) => {
        /// Closed set of command descriptors understood by the miners.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CommandName {
            $($variant,)*
        }

        impl CommandName {
            pub const ALL: &'static [CommandName] = &[$(CommandName::$variant,)*];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(CommandName::$variant => $name,)*
                }
            }

            pub fn arity(&self) -> Arity {
                match self {
                    $(CommandName::$variant => $arity,)*
                }
            }
        }

        impl FromStr for CommandName {
            type Err = DStoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(CommandName::$variant),)*
                    _ => Err(DStoreError::UnknownCommand(s.to_string())),
                }
            }
        }
    };
}

command_catalog! {
    QueryRoots => "C_QUERY_ROOTS", Arity::Exact(0);
    QueryViewAll => "C_QUERY_VIEW_ALL", Arity::Between(0, 1);
    QueryViewFiles => "C_QUERY_VIEW_FILES", Arity::Between(0, 1);
    QueryViewFolders => "C_QUERY_VIEW_FOLDERS", Arity::Between(0, 1);
    CreateFile => "C_CREATE_FILE", Arity::Exact(0);
    CreateFolder => "C_CREATE_FOLDER", Arity::Exact(0);
    QueryGetRemoteObject => "C_QUERY_GET_REMOTE_OBJECT", Arity::Exact(1);
    Delete => "C_DELETE", Arity::Exact(0);
    DeleteBatch => "C_DELETE_BATCH", Arity::AtLeast(1);
    Rename => "C_RENAME", Arity::Exact(1);
    Copy => "C_COPY", Arity::Between(1, 2);
    CopyBatch => "C_COPY_BATCH", Arity::AtLeast(1);
    Search => "C_SEARCH", Arity::Between(1, 2);
    Cancel => "C_CANCEL", Arity::Exact(0);
    SetReadOnly => "C_SET_READONLY", Arity::Exact(1);
    SetLastModified => "C_SET_LASTMODIFIED", Arity::Exact(1);
    QueryBasicProperty => "C_QUERY_BASIC_PROPERTY", Arity::Exact(0);
    QueryCanWriteProperty => "C_QUERY_CAN_WRITE_PROPERTY", Arity::Exact(0);
    QueryAdvanceProperty => "C_QUERY_ADVANCE_PROPERTY", Arity::Exact(0);
    QueryFileClassification => "C_QUERY_FILE_CLASSIFICATION", Arity::Exact(0);
    QueryExists => "C_QUERY_EXISTS", Arity::Exact(0);
    GetOsType => "C_GET_OSTYPE", Arity::Exact(0);
    DownloadFile => "C_DOWNLOAD_FILE", Arity::Between(1, 3);
    SystemEncoding => "C_SYSTEM_ENCODING", Arity::Exact(0);
    QueryUnusedPort => "C_QUERY_UNUSED_PORT", Arity::Exact(0);
    Exec => "C_EXEC", Arity::AtLeast(1);
    QueryProcesses => "C_QUERY_PROCESSES", Arity::Exact(0);
    Kill => "C_KILL", Arity::Exact(1);
    StartSpirit => "C_START_SPIRIT", Arity::Exact(0);
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for CommandName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for CommandName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
