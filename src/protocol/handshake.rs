//! Version check performed before any command is exchanged.
//!
//! The server announces `DataStore.<version>.<minor>.<micro>`; the client
//! compares it with its own string.

use std::fmt;

pub const DATASTORE_VERSION: &str = "DataStore.8.0.0";

const VERSION_INDEX_PROTOCOL: usize = 0;
const VERSION_INDEX_VERSION: usize = 1;
const VERSION_INDEX_MINOR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResult {
    Correct,
    /// Server is one major version ahead.
    ServerRecentNewer,
    /// Server is one or two major versions behind.
    ServerRecentOlder,
    ServerNewer,
    ServerOlder,
    /// Not a DataStore server at all.
    Incorrect,
    Unexpected,
    Timeout,
}

impl HandshakeResult {
    /// Whether the connection may proceed.
    pub fn is_compatible(&self) -> bool {
        matches!(
            self,
            HandshakeResult::Correct | HandshakeResult::ServerRecentNewer | HandshakeResult::ServerRecentOlder
        )
    }

    pub fn message(&self) -> &'static str {
        match self {
            HandshakeResult::Correct => "connected",
            HandshakeResult::ServerRecentNewer => "the client is older than the server",
            HandshakeResult::ServerRecentOlder => "the server is older than the client",
            HandshakeResult::ServerNewer => "incompatible client: the server is a newer DataStore server",
            HandshakeResult::ServerOlder => "incompatible server: the server is an older DataStore server",
            HandshakeResult::Incorrect => "incompatible protocol: not a valid DataStore server",
            HandshakeResult::Unexpected => "unexpected handshake failure",
            HandshakeResult::Timeout => "timeout waiting for socket activity",
        }
    }
}

impl fmt::Display for HandshakeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Version numbers announced by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerVersion {
    pub version: u32,
    pub minor: u32,
}

fn parse(handshake: &str) -> Option<(String, ServerVersion)> {
    let parts: Vec<&str> = handshake.trim().split('.').collect();
    let protocol = parts.get(VERSION_INDEX_PROTOCOL)?.to_string();
    let version = parts.get(VERSION_INDEX_VERSION)?.parse().ok()?;
    let minor = parts.get(VERSION_INDEX_MINOR)?.parse().ok()?;
    Some((protocol, ServerVersion { version, minor }))
}

/// Classifies the server's handshake against `client`.
pub fn classify(client: &str, server: &str) -> (HandshakeResult, Option<ServerVersion>) {
    if server.starts_with("<DataElement") {
        return (HandshakeResult::ServerOlder, None);
    }
    let Some((client_protocol, client_version)) = parse(client) else {
        return (HandshakeResult::Unexpected, None);
    };
    let Some((server_protocol, server_version)) = parse(server) else {
        return (HandshakeResult::Incorrect, None);
    };
    if server == client {
        return (HandshakeResult::Correct, Some(server_version));
    }
    if server_protocol != client_protocol {
        return (HandshakeResult::Incorrect, Some(server_version));
    }

    let ours = client_version.version;
    let theirs = server_version.version;
    let result = if theirs == ours {
        HandshakeResult::Correct
    } else if theirs > ours {
        if theirs - 1 == ours {
            HandshakeResult::ServerRecentNewer
        } else {
            HandshakeResult::ServerNewer
        }
    } else if theirs + 1 == ours || theirs + 2 == ours {
        HandshakeResult::ServerRecentOlder
    } else {
        HandshakeResult::ServerOlder
    };
    (result, Some(server_version))
}
