//! Request envelopes, protocol tags and the multipart framing used on the
//! wire.

use crate::error::{LanComError, Result};

/// Separator between the request tag and the payload.
pub const SEPARATOR: u8 = b'|';

/// A multipart message: one or more byte frames delivered together.
pub type Frames = Vec<Vec<u8>>;

/// Requests answered by the master's dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MasterRequest {
    /// Liveness probe; replies with the master's clock.
    Ping,
    /// Payload: a JSON `NodeInfo`. Reply: the JSON topic index.
    RegisterNode,
    /// Payload: the node id. Reply: `SUCCESS`.
    NodeOffline,
    /// Reply: JSON map of node id to `NodeInfo`.
    GetNodesInfo,
    /// Payload: a service name. Reply: JSON `NodeInfo` or `null`.
    LookupService,
    /// Payload: a topic name. Reply: JSON `NodeInfo` or `null`.
    LookupTopic,
}

impl MasterRequest {
    pub const ALL: [MasterRequest; 6] = [
        Self::Ping,
        Self::RegisterNode,
        Self::NodeOffline,
        Self::GetNodesInfo,
        Self::LookupService,
        Self::LookupTopic,
    ];

    /// Wire tag used as the service name of the request.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::RegisterNode => "REGISTER_NODE",
            Self::NodeOffline => "NODE_OFFLINE",
            Self::GetNodesInfo => "GET_NODES_INFO",
            Self::LookupService => "LOOKUP_SERVICE",
            Self::LookupTopic => "LOOKUP_TOPIC",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.tag() == tag)
    }
}

/// Requests answered by a peer node's control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRequest {
    /// Liveness probe sent by the master.
    Ping,
    /// Payload: JSON `ComponentInfo` of a publisher to connect to.
    UpdateSubscriber,
}

impl NodeRequest {
    pub const ALL: [NodeRequest; 2] = [Self::Ping, Self::UpdateSubscriber];

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::UpdateSubscriber => "UPDATE_SUBSCRIBER",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.tag() == tag)
    }
}

/// Typed replies sent instead of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Success,
    Error,
    Timeout,
}

impl ResponseCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
        }
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.as_str().as_bytes().to_vec()
    }

    /// Classify a reply. Returns `None` for an ordinary payload.
    pub fn from_reply(reply: &[u8]) -> Option<Self> {
        match reply {
            b"SUCCESS" => Some(Self::Success),
            b"ERROR" => Some(Self::Error),
            b"TIMEOUT" => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// Reject names that cannot travel in an envelope.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.as_bytes().contains(&SEPARATOR) {
        return Err(LanComError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A request addressed to a named service (or protocol tag).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub name: String,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }

    pub fn master(kind: MasterRequest, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(kind.tag(), payload)
    }

    pub fn node(kind: NodeRequest, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(kind.tag(), payload)
    }

    /// Single-frame form: `name|payload`.
    pub fn encode(&self) -> Frames {
        let mut frame = Vec::with_capacity(self.name.len() + 1 + self.payload.len());
        frame.extend_from_slice(self.name.as_bytes());
        frame.push(SEPARATOR);
        frame.extend_from_slice(&self.payload);
        vec![frame]
    }

    /// Split an inbound message into `(name, payload)`.
    ///
    /// A single frame is split at the first separator; a frame without one
    /// is a bare name. With several frames the first is the name and the
    /// rest are concatenated into the payload.
    pub fn decode(frames: &[Vec<u8>]) -> Result<Self> {
        let (name, payload) = match frames {
            [] => return Err(LanComError::Protocol("empty request".to_string())),
            [single] => match single.iter().position(|b| *b == SEPARATOR) {
                Some(pos) => (&single[..pos], single[pos + 1..].to_vec()),
                None => (&single[..], Vec::new()),
            },
            [head, rest @ ..] => (&head[..], rest.concat()),
        };
        let name = std::str::from_utf8(name)
            .map_err(|e| LanComError::Protocol(format!("request name is not UTF-8: {e}")))?;
        Ok(Self::new(name, payload))
    }
}

/// Pack a multipart message into one transport message:
/// `u32 count`, then `u32 len` + bytes per frame, all big-endian.
pub fn encode_frames(frames: &[Vec<u8>]) -> Vec<u8> {
    let body: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut out = Vec::with_capacity(4 + body);
    out.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(frame);
    }
    out
}

/// Inverse of [`encode_frames`].
pub fn decode_frames(bytes: &[u8]) -> Result<Frames> {
    fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
        bytes
            .get(at..at + 4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_be_bytes)
            .ok_or_else(|| LanComError::Protocol("truncated frame header".to_string()))
    }

    let count = read_u32(bytes, 0)? as usize;
    let mut cursor = 4;
    let mut frames = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let len = read_u32(bytes, cursor)? as usize;
        cursor += 4;
        let frame = bytes
            .get(cursor..cursor + len)
            .ok_or_else(|| LanComError::Protocol("truncated frame body".to_string()))?;
        frames.push(frame.to_vec());
        cursor += len;
    }
    if cursor != bytes.len() {
        return Err(LanComError::Protocol(format!(
            "{} trailing bytes after frames",
            bytes.len() - cursor
        )));
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let cases: Vec<(&str, Vec<u8>)> = vec![
            ("REGISTER_NODE", br#"{"name":"a|b"}"#.to_vec()),
            ("PING", Vec::new()),
            ("echo", vec![0, 255, b'|', b'|', 7]),
        ];
        for (name, payload) in cases {
            let request = Request::new(name, payload.clone());
            let decoded = Request::decode(&request.encode()).unwrap();
            assert_eq!(decoded.name, name);
            assert_eq!(decoded.payload, payload);
        }
    }

    #[test]
    fn test_decode_multipart_form() {
        let frames = vec![b"echo".to_vec(), b"hello ".to_vec(), b"world".to_vec()];
        let request = Request::decode(&frames).unwrap();
        assert_eq!(request.name, "echo");
        assert_eq!(request.payload, b"hello world");
    }

    #[test]
    fn test_decode_bare_name() {
        let request = Request::decode(&[b"GET_NODES_INFO".to_vec()]).unwrap();
        assert_eq!(request.name, "GET_NODES_INFO");
        assert!(request.payload.is_empty());
    }

    #[test]
    fn test_decode_rejects_empty_and_non_utf8() {
        assert!(matches!(Request::decode(&[]), Err(LanComError::Protocol(_))));
        let bad = vec![vec![0xff, 0xfe, SEPARATOR, 1]];
        assert!(matches!(Request::decode(&bad), Err(LanComError::Protocol(_))));
    }

    #[test]
    fn test_frames_roundtrip_and_truncation() {
        let frames = vec![b"temp".to_vec(), Vec::new(), vec![1, 2, 3]];
        let packed = encode_frames(&frames);
        assert_eq!(decode_frames(&packed).unwrap(), frames);

        assert!(decode_frames(&packed[..packed.len() - 1]).is_err());
        let mut trailing = packed.clone();
        trailing.push(0);
        assert!(decode_frames(&trailing).is_err());
    }

    #[test]
    fn test_tags() {
        for kind in MasterRequest::ALL {
            assert_eq!(MasterRequest::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(
            NodeRequest::from_tag("UPDATE_SUBSCRIBER"),
            Some(NodeRequest::UpdateSubscriber)
        );
        assert_eq!(MasterRequest::from_tag("UPDATE_SUBSCRIBER"), None);
    }

    #[test]
    fn test_response_codes() {
        assert_eq!(ResponseCode::from_reply(b"ERROR"), Some(ResponseCode::Error));
        assert_eq!(ResponseCode::from_reply(b"TIMEOUT"), Some(ResponseCode::Timeout));
        assert_eq!(ResponseCode::from_reply(b"payload"), None);
        assert_eq!(ResponseCode::Success.to_bytes(), b"SUCCESS");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("temp").is_ok());
        assert!(validate_name("robot/arm").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a|b").is_err());
    }
}
