use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Wraps a reader and reports every chunk of bytes read to a callback.
/// Used to feed transfer metrics while streaming large downloads.
pub struct CountingReader<R> {
    inner: R,
    on_read: Box<dyn Fn(u64) + Send + Sync>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, on_read: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            inner,
            on_read: Box::new(on_read),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = (buf.filled().len() - before) as u64;
            if read > 0 {
                (self.on_read)(read);
            }
        }
        poll
    }
}
