use bytes::Bytes;

use crate::error::Error;

/// Response/request payload. Streaming bodies come straight from hyper; the
/// cache layers need full bodies (hashing, chunking, range slicing), so
/// [`Body::store_all`] buffers a streaming body in place.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Full(Bytes),
    Streaming(hyper::Body),
}

impl Body {
    pub fn empty() -> Self {
        Self::Empty
    }

    /// Buffer the body into memory, replacing a streaming variant.
    pub async fn store_all(&mut self) -> Result<Bytes, Error> {
        match self {
            Self::Empty => Ok(Bytes::new()),
            Self::Full(bytes) => Ok(bytes.clone()),
            Self::Streaming(_) => {
                let body = std::mem::take(self);
                let Self::Streaming(inner) = body else {
                    unreachable!()
                };
                let bytes = hyper::body::to_bytes(inner).await?;
                *self = Self::Full(bytes.clone());
                Ok(bytes)
            }
        }
    }

    /// Buffered length, if known without consuming the body.
    pub fn len(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Full(bytes) => Some(bytes.len() as u64),
            Self::Streaming(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.len(), Some(0))
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Full(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Full(b) => write!(f, "Body::Full({} bytes)", b.len()),
            Self::Streaming(_) => f.write_str("Body::Streaming"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            Self::Empty
        } else {
            Self::Full(bytes)
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Self::from(Bytes::from(v))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::from(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::from(Bytes::from_static(s.as_bytes()))
    }
}

impl From<hyper::Body> for Body {
    fn from(body: hyper::Body) -> Self {
        Self::Streaming(body)
    }
}

impl From<Body> for hyper::Body {
    fn from(body: Body) -> Self {
        match body {
            Body::Empty => hyper::Body::empty(),
            Body::Full(bytes) => hyper::Body::from(bytes),
            Body::Streaming(inner) => inner,
        }
    }
}
