//! Request bodies.

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_core::Stream;

use crate::error::BoxError;

/// A request body.
///
/// A body is either *reusable* (a buffered chunk of bytes that can be
/// replayed for retries and 307/308 redirects) or *streaming* (produced
/// once; a retry or redirect that needs to resend it will surface an error
/// instead).
pub struct Body {
    inner: Inner,
}

enum Inner {
    Reusable(Bytes),
    Streaming(Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>),
}

// ===== impl Body =====

impl Body {
    /// Returns a reference to the internal data of the `Body`.
    ///
    /// `None` is returned, if the underlying data is a stream.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.inner {
            Inner::Reusable(bytes) => Some(bytes.as_ref()),
            Inner::Streaming(..) => None,
        }
    }

    /// Wrap a futures `Stream` in a box inside `Body`.
    ///
    /// # Example
    ///
    /// ```
    /// # use weft::Body;
    /// let chunks: Vec<Result<_, ::std::io::Error>> = vec![Ok("hello"), Ok(" "), Ok("world")];
    ///
    /// let stream = futures_util::stream::iter(chunks);
    ///
    /// let body = Body::wrap_stream(stream);
    /// ```
    pub fn wrap_stream<S>(stream: S) -> Body
    where
        S: futures_core::TryStream + Send + 'static,
        S::Error: Into<BoxError>,
        Bytes: From<S::Ok>,
    {
        use futures_util::TryStreamExt;

        Body {
            inner: Inner::Streaming(Box::pin(
                stream.map_ok(Bytes::from).map_err(Into::into),
            )),
        }
    }

    pub(crate) fn empty() -> Body {
        Body::reusable(Bytes::new())
    }

    pub(crate) fn reusable(chunk: Bytes) -> Body {
        Body {
            inner: Inner::Reusable(chunk),
        }
    }

    /// A clone for replay, when the body is rewindable.
    pub(crate) fn try_clone(&self) -> Option<Body> {
        match self.inner {
            Inner::Reusable(ref chunk) => Some(Body::reusable(chunk.clone())),
            Inner::Streaming { .. } => None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(&self.inner, Inner::Reusable(bytes) if bytes.is_empty())
    }

    /// Known length, for `Content-Length`. Streams are chunked instead.
    pub(crate) fn content_length(&self) -> Option<u64> {
        match &self.inner {
            Inner::Reusable(bytes) => Some(bytes.len() as u64),
            Inner::Streaming(..) => None,
        }
    }

    pub(crate) fn into_data_stream(self) -> DataStream {
        DataStream {
            inner: Some(self.inner),
        }
    }
}

impl Default for Body {
    #[inline]
    fn default() -> Body {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    #[inline]
    fn from(bytes: Bytes) -> Body {
        Body::reusable(bytes)
    }
}

impl From<Vec<u8>> for Body {
    #[inline]
    fn from(vec: Vec<u8>) -> Body {
        Body::reusable(vec.into())
    }
}

impl From<&'static [u8]> for Body {
    #[inline]
    fn from(s: &'static [u8]) -> Body {
        Body::reusable(Bytes::from_static(s))
    }
}

impl From<String> for Body {
    #[inline]
    fn from(s: String) -> Body {
        Body::reusable(s.into())
    }
}

impl From<&'static str> for Body {
    #[inline]
    fn from(s: &'static str) -> Body {
        s.as_bytes().into()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.inner {
            Inner::Reusable(bytes) => f
                .debug_struct("Body")
                .field("len", &bytes.len())
                .finish(),
            Inner::Streaming(..) => f.debug_struct("Body").field("stream", &"..").finish(),
        }
    }
}

/// The body flattened to a stream of data chunks for the wire layer.
pub(crate) struct DataStream {
    inner: Option<Inner>,
}

impl Stream for DataStream {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut() {
            None => Poll::Ready(None),
            Some(Inner::Reusable(_)) => {
                let Some(Inner::Reusable(bytes)) = self.inner.take() else {
                    unreachable!()
                };
                if bytes.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(bytes)))
                }
            }
            Some(Inner::Streaming(stream)) => {
                let next = futures_core::ready!(stream.as_mut().poll_next(cx));
                if next.is_none() {
                    self.inner = None;
                }
                Poll::Ready(next)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn reusable_bodies_clone() {
        let body: Body = "payload".into();
        assert!(body.try_clone().is_some());
        assert_eq!(body.content_length(), Some(7));
        assert_eq!(body.as_bytes(), Some(&b"payload"[..]));
    }

    #[test]
    fn streaming_bodies_do_not_clone() {
        let chunks: Vec<Result<_, std::io::Error>> = vec![Ok("a"), Ok("b")];
        let body = Body::wrap_stream(futures_util::stream::iter(chunks));
        assert!(body.try_clone().is_none());
        assert_eq!(body.content_length(), None);
    }

    #[tokio::test]
    async fn data_stream_yields_chunks() {
        let chunks: Vec<Result<_, std::io::Error>> = vec![Ok("a"), Ok("bc")];
        let mut stream = Body::wrap_stream(futures_util::stream::iter(chunks)).into_data_stream();

        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from("a"));
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from("bc"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_reusable_yields_nothing() {
        let mut stream = Body::empty().into_data_stream();
        assert!(stream.next().await.is_none());
    }
}
