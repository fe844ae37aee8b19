//! LOCAL INFILE sub-protocol responder.
//!
//! After a `LOAD DATA LOCAL INFILE` statement the server answers with a
//! request packet (`0xfb` + filename); the client then streams the file
//! bytes as framed packets and terminates with an empty packet, after which
//! the server sends its final OK or ERR. The client MUST send the empty
//! terminator even when no data was available, and every client-side
//! failure is surfaced only after that terminator and the final reply, so
//! the session always returns to the command-ready state.
//! Reference: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_com_query_response_local_infile_request.html

use crate::error::{Error, Result};
use crate::protocol::framer::PacketFramer;
use crate::protocol::packet::{OkPacket, ServerReply};
use crate::session::Session;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation state for one bulk operation.
#[derive(Debug, Clone)]
pub(crate) struct Control {
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl Control {
    pub(crate) fn new(timeout: Option<Duration>, cancel: Option<CancellationToken>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            cancel,
        }
    }

    /// Checked between chunks and rows.
    pub(crate) fn interrupted(&self) -> Result<()> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    /// Bounds one await by the operation deadline and the cancellation
    /// token, so both are honored at every suspension point.
    pub(crate) async fn bound<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadlined = async {
            match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout),
                },
                None => fut.await,
            }
        };
        tokio::select! {
            _ = cancelled => Err(Error::Cancelled),
            result = deadlined => result,
        }
    }
}

/// How long the responder keeps reading for the final reply once the
/// operation itself has already failed. The operation deadline may be in
/// the past at that point; without consuming the reply the session would
/// not return to the command-ready state.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Where the streamed bytes come from.
pub(crate) enum ByteSource<'a> {
    /// A filesystem path, opened lazily once the server asks for data so a
    /// missing file can still complete the sub-protocol cleanly.
    Path(&'a str),
    Stream(&'a mut (dyn AsyncRead + Unpin + Send)),
}

/// Outcome of sending the statement.
pub(crate) enum InfileStart {
    /// The server asked for local data; streaming may begin.
    Request,
    /// The server completed the statement without asking for data.
    Done(OkPacket),
}

/// Sends `sql` and waits for the server's local-data request.
pub(crate) async fn start<S>(
    session: &mut Session<S>,
    sql: &str,
    ctl: &Control,
) -> Result<InfileStart>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    ctl.interrupted()?;
    session.send_command(sql).await?;
    match ctl.bound(session.receive_reply()).await? {
        ServerReply::LocalInfile(request) => {
            // the echoed filename is whatever the statement named; the
            // configured source is streamed regardless
            tracing::debug!(
                filename = %String::from_utf8_lossy(&request.filename),
                "server requested local data"
            );
            Ok(InfileStart::Request)
        }
        ServerReply::Ok(ok) => {
            tracing::debug!(affected = ok.affected_rows, "server skipped the data phase");
            Ok(InfileStart::Done(ok))
        }
        ServerReply::Err(err) => Err(err.into_error()),
        ServerReply::Raw(_) => Err(Error::Protocol(
            "unexpected result set in response to LOAD DATA".to_string(),
        )),
    }
}

/// Reads the final OK/ERR after the trailer. A pending client-side error
/// takes precedence over whatever the drained reply says; the reply is
/// consumed regardless so the session stays command-ready.
pub(crate) async fn confirm<S>(
    session: &mut Session<S>,
    ctl: &Control,
    pending: Option<Error>,
) -> Result<OkPacket>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Some(err) = pending {
        // the deadline may already be past (that is often why we are here),
        // so the drain runs under its own grace period
        drain_final_reply(session).await;
        return Err(err);
    }
    match ctl.bound(session.receive_reply()).await {
        Ok(ServerReply::Ok(ok)) => Ok(ok),
        Ok(ServerReply::Err(err)) => Err(err.into_error()),
        Ok(_) => Err(Error::Protocol(
            "unexpected reply after the data trailer".to_string(),
        )),
        Err(err @ (Error::Timeout | Error::Cancelled)) => {
            drain_final_reply(session).await;
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Consumes the server's final reply under [`DRAIN_GRACE`] so the LOCAL
/// INFILE state is left cleanly even when the operation has already failed.
async fn drain_final_reply<S>(session: &mut Session<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match tokio::time::timeout(DRAIN_GRACE, session.receive_reply()).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            tracing::debug!(error = %err, "error while draining the final reply");
        }
        Err(_) => {
            tracing::debug!("server did not deliver a final reply within the drain grace");
        }
    }
}

/// Runs the complete sub-protocol over a byte source.
pub(crate) async fn run<S>(
    session: &mut Session<S>,
    sql: &str,
    source: ByteSource<'_>,
    ctl: &Control,
) -> Result<OkPacket>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match start(session, sql, ctl).await? {
        InfileStart::Done(ok) => Ok(ok),
        InfileStart::Request => stream_source(session, source, ctl).await,
    }
}

async fn stream_source<S>(
    session: &mut Session<S>,
    source: ByteSource<'_>,
    ctl: &Control,
) -> Result<OkPacket>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut pending: Option<Error> = None;
    let mut file: Option<File> = None;
    let mut reader: Option<&mut (dyn AsyncRead + Unpin + Send)> = None;

    match source {
        ByteSource::Path(path) => match File::open(path).await {
            Ok(opened) => {
                file = Some(opened);
                reader = file.as_mut().map(|f| f as &mut (dyn AsyncRead + Unpin + Send));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                pending = Some(Error::FileNotFound {
                    path: path.to_string(),
                    source: err,
                });
            }
            Err(err) => pending = Some(Error::Io(err)),
        },
        ByteSource::Stream(stream) => reader = Some(stream),
    }

    let mut framer = PacketFramer::new(&mut *session);
    if let Some(reader) = reader {
        let mut chunk = [0u8; 8192];
        loop {
            if let Err(err) = ctl.interrupted() {
                pending = Some(err);
                break;
            }
            let read = ctl
                .bound(async { reader.read(&mut chunk).await.map_err(Error::from) })
                .await;
            match read {
                Ok(0) => break,
                Ok(n) => framer.write(&chunk[..n]).await?,
                Err(err) => {
                    pending = Some(err);
                    break;
                }
            }
        }
    }

    match &pending {
        None => {
            framer.finish().await?;
        }
        Some(_) => {
            framer.abort().await?;
        }
    }
    confirm(session, ctl, pending).await
}
