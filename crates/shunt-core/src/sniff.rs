use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// TLS ContentType for Handshake.
const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// TLS HandshakeType for ClientHello.
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// TLS record header size.
const TLS_RECORD_HEADER_LEN: usize = 5;

/// RFC 5246 record payload limit.
const TLS_MAX_RECORD_LEN: usize = 16384;

/// server_name extension type.
const TLS_EXTENSION_TYPE_SNI: u16 = 0x0000;

/// host_name entry type within the server_name extension.
const TLS_SNI_NAME_TYPE_HOSTNAME: u8 = 0x00;

#[derive(Debug, Error)]
pub enum SniffError {
    #[error("not a TLS handshake record (content type 0x{0:02x})")]
    NotHandshake(u8),
    #[error("unsupported TLS record version 0x{0:04x}")]
    BadVersion(u16),
    #[error("TLS record length {0} exceeds the 16384-byte limit")]
    OversizedRecord(usize),
    #[error("record does not carry a ClientHello")]
    NotClientHello,
    #[error("ClientHello carries no server name")]
    MissingSni,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A ClientHello captured off a client socket before any handshake work.
///
/// The raw handshake bytes are retained for replay: the hello is consumed
/// only long enough to learn the SNI routing target, and the handshake must
/// still complete between the client and the real origin.
#[derive(Debug)]
pub struct ClientHello {
    /// Hostname from the server_name extension.
    pub server_name: String,
    payload: Vec<u8>,
}

impl ClientHello {
    /// Read one TLS record from `reader` and extract the SNI hostname.
    ///
    /// A hello without a server_name extension is an error; there is no
    /// fallback routing for SNI-less clients.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, SniffError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; TLS_RECORD_HEADER_LEN];
        reader.read_exact(&mut header).await?;

        if header[0] != TLS_CONTENT_TYPE_HANDSHAKE {
            return Err(SniffError::NotHandshake(header[0]));
        }
        let version = u16::from_be_bytes([header[1], header[2]]);
        if !(0x0301..=0x0304).contains(&version) {
            return Err(SniffError::BadVersion(version));
        }
        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if record_len > TLS_MAX_RECORD_LEN {
            return Err(SniffError::OversizedRecord(record_len));
        }

        let mut payload = vec![0u8; record_len];
        reader.read_exact(&mut payload).await?;

        if payload.first() != Some(&TLS_HANDSHAKE_TYPE_CLIENT_HELLO) {
            return Err(SniffError::NotClientHello);
        }
        let server_name = extract_sni(&payload).ok_or(SniffError::MissingSni)?;

        Ok(Self {
            server_name,
            payload,
        })
    }

    /// The captured handshake bytes, re-framed as the record the client
    /// originally sent.
    pub fn to_record(&self) -> Vec<u8> {
        let mut record = Vec::with_capacity(TLS_RECORD_HEADER_LEN + self.payload.len());
        record.extend_from_slice(&record_header(self.payload.len()));
        record.extend_from_slice(&self.payload);
        record
    }
}

/// TLS record framing for a handshake fragment of `len` bytes. The length
/// goes out big-endian with the low byte explicitly masked.
pub fn record_header(len: usize) -> [u8; 5] {
    [0x16, 0x03, 0x01, (len >> 8) as u8, (len & 0xff) as u8]
}

/// Walk the ClientHello body far enough to find the server_name extension.
fn extract_sni(handshake: &[u8]) -> Option<String> {
    // handshake type (1) + length (3) + version (2) + random (32)
    let mut pos = 38usize;

    let session_len = *handshake.get(pos)? as usize;
    pos += 1 + session_len;

    let suites_len = read_u16(handshake, pos)? as usize;
    pos += 2 + suites_len;

    let compression_len = *handshake.get(pos)? as usize;
    pos += 1 + compression_len;

    let extensions_len = read_u16(handshake, pos)? as usize;
    pos += 2;
    let extensions_end = pos.checked_add(extensions_len)?.min(handshake.len());

    while pos + 4 <= extensions_end {
        let ext_type = read_u16(handshake, pos)?;
        let ext_len = read_u16(handshake, pos + 2)? as usize;
        pos += 4;
        if pos + ext_len > handshake.len() {
            return None;
        }
        if ext_type == TLS_EXTENSION_TYPE_SNI {
            return parse_sni_extension(&handshake[pos..pos + ext_len]);
        }
        pos += ext_len;
    }
    None
}

fn parse_sni_extension(data: &[u8]) -> Option<String> {
    let list_len = read_u16(data, 0)? as usize;
    let mut pos = 2usize;
    let end = (2 + list_len).min(data.len());

    while pos + 3 <= end {
        let name_type = data[pos];
        let name_len = read_u16(data, pos + 1)? as usize;
        pos += 3;
        if pos + name_len > data.len() {
            return None;
        }
        if name_type == TLS_SNI_NAME_TYPE_HOSTNAME {
            let name = &data[pos..pos + name_len];
            if !name.is_empty() && name.iter().all(|&b| b.is_ascii() && b != 0) {
                return String::from_utf8(name.to_vec()).ok();
            }
        }
        pos += name_len;
    }
    None
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]))
}


#[cfg(test)]
mod tests {
    use super::testutil::client_hello_record;
    use super::*;

    #[tokio::test]
    async fn test_extracts_sni_and_retains_record() {
        let record = client_hello_record(Some("example.com"));
        let hello = ClientHello::read_from(&mut record.as_slice())
            .await
            .unwrap();

        assert_eq!(hello.server_name, "example.com");
        assert_eq!(hello.to_record(), record);
    }

    #[tokio::test]
    async fn test_missing_sni_is_an_error() {
        let record = client_hello_record(None);
        let err = ClientHello::read_from(&mut record.as_slice())
            .await
            .unwrap_err();
        assert!(matches!(err, SniffError::MissingSni));
    }

    #[tokio::test]
    async fn test_rejects_non_tls_bytes() {
        let data = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
        let err = ClientHello::read_from(&mut data.as_slice())
            .await
            .unwrap_err();
        assert!(matches!(err, SniffError::NotHandshake(b'G')));
    }

    #[tokio::test]
    async fn test_rejects_non_client_hello_handshake() {
        let mut record = client_hello_record(Some("example.com"));
        record[5] = 0x02; // ServerHello
        let err = ClientHello::read_from(&mut record.as_slice())
            .await
            .unwrap_err();
        assert!(matches!(err, SniffError::NotClientHello));
    }

    #[tokio::test]
    async fn test_rejects_bad_record_version() {
        let mut record = client_hello_record(Some("example.com"));
        record[1] = 0x02;
        let err = ClientHello::read_from(&mut record.as_slice())
            .await
            .unwrap_err();
        assert!(matches!(err, SniffError::BadVersion(0x0201)));
    }

    #[tokio::test]
    async fn test_truncated_record_is_io_error() {
        let record = client_hello_record(Some("example.com"));
        let truncated = &record[..record.len() - 4];
        let err = ClientHello::read_from(&mut &truncated[..]).await.unwrap_err();
        assert!(matches!(err, SniffError::Io(_)));
    }

    #[test]
    fn test_record_header_masks_low_byte() {
        assert_eq!(record_header(511), [0x16, 0x03, 0x01, 0x01, 0xFF]);
        assert_eq!(record_header(256), [0x16, 0x03, 0x01, 0x01, 0x00]);
        assert_eq!(record_header(2), [0x16, 0x03, 0x01, 0x00, 0x02]);
    }
}
