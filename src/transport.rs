//! Byte-stream transport for live sessions.
//!
//! Each inbound message is a big-endian `u32` length followed by that many
//! bytes of encoded image. A zero length ends the session cleanly; end of
//! stream is a disconnect. Every frame is answered with one JSON line.

use crate::{
    error::Error,
    event::Event,
    job::{cleanup_files, CancelToken, Job, RelayEnd, DEFAULT_POLL_INTERVAL},
    pipeline::{AnnotationOutput, BatchPipeline},
    session::{FrameReply, LiveSession},
};
use serde::Serialize;
use std::{
    io::ErrorKind,
    ops::ControlFlow,
    path::{Path, PathBuf},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, info, warn};

pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The client sent the end marker.
    Finished,
    Disconnected,
    /// The stop token was cancelled on this side.
    Interrupted,
}

#[derive(Debug, PartialEq, Eq)]
enum Message {
    Frame(Vec<u8>),
    End,
    /// A frame above the size limit whose payload was skipped.
    Oversized(usize),
    Closed,
}

async fn read_message<R>(reader: &mut R, limit: usize) -> Result<Message, Error>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(Message::Closed),
        Err(e) => return Err(Error::TransportIo(e)),
    };
    if len == 0 {
        return Ok(Message::End);
    }
    if len > limit {
        let mut payload = (&mut *reader).take(len as u64);
        let skipped = tokio::io::copy(&mut payload, &mut tokio::io::sink())
            .await
            .map_err(Error::TransportIo)?;
        return Ok(if skipped == len as u64 {
            Message::Oversized(len)
        } else {
            Message::Closed
        });
    }
    let mut buf = vec![0; len];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(Message::Frame(buf)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(Message::Closed),
        Err(e) => Err(Error::TransportIo(e)),
    }
}

async fn write_line<W>(writer: &mut W, line: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn stopped(stop: &CancelToken) {
    while !stop.is_cancelled() {
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}

/// Feed frames from `reader` into `session` until the client finishes, goes
/// away or `stop` is cancelled. Per-frame failures, oversized frames
/// included, are answered with an error reply and the session stays open.
pub async fn serve_live<R, W>(
    session: &mut LiveSession,
    reader: &mut R,
    writer: &mut W,
    stop: &CancelToken,
) -> Result<StreamEnd, Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    serve_frames(session, reader, writer, stop, MAX_FRAME_BYTES).await
}

async fn serve_frames<R, W>(
    session: &mut LiveSession,
    reader: &mut R,
    writer: &mut W,
    stop: &CancelToken,
    limit: usize,
) -> Result<StreamEnd, Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            () = stopped(stop) => return Ok(StreamEnd::Interrupted),
            message = read_message(reader, limit) => message?,
        };

        let reply = match message {
            Message::Closed => return Ok(StreamEnd::Disconnected),
            Message::End => return Ok(StreamEnd::Finished),
            Message::Oversized(len) => {
                warn!(len, limit, "skipped oversized live frame");
                FrameReply::Rejected {
                    error: Error::FrameTooLarge(len, limit).to_string(),
                }
            }
            Message::Frame(bytes) => session.process_frame(&bytes).unwrap_or_else(|e| {
                warn!(error = ?e, "failed to process live frame");
                FrameReply::Rejected {
                    error: e.to_string(),
                }
            }),
        };
        let line = serde_json::to_vec(&reply).map_err(Error::SerializeReply)?;
        if let Err(e) = write_line(writer, &line).await {
            debug!(error = %e, "client stopped reading");
            return Ok(StreamEnd::Disconnected);
        }
    }
}

#[derive(Debug)]
pub struct LiveOutcome {
    pub end: StreamEnd,
    pub frames_recorded: usize,
    /// `None` when nothing was recorded or annotation failed.
    pub annotation: Option<AnnotationOutput>,
    pub relay: Option<RelayEnd>,
}

/// Queue one event for the client. Breaks once the client is gone.
fn forward<T>(tx: &mpsc::UnboundedSender<Vec<u8>>, event: &Event<T>) -> ControlFlow<()>
where
    T: Serialize,
{
    match serde_json::to_vec(&event.to_wire()) {
        Ok(line) => {
            if tx.send(line).is_ok() {
                ControlFlow::Continue(())
            } else {
                debug!("client went away, cancelling annotation");
                ControlFlow::Break(())
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to serialize event");
            ControlFlow::Continue(())
        }
    }
}

/// Serve a live session to completion, then annotate its recording.
///
/// The session is closed and whatever it recorded is annotated on every exit
/// path, transport faults included; the fault is returned afterwards. The
/// annotation job's events are streamed to `writer` as JSON lines only when
/// the client finished cleanly, and the raw recording is deleted once the
/// job has been joined.
pub async fn run_live_session<R, W>(
    mut session: LiveSession,
    reader: &mut R,
    writer: &mut W,
    pipeline: BatchPipeline,
    reference: &Path,
    annotated_out: PathBuf,
    stop: &CancelToken,
) -> Result<LiveOutcome, Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let served = serve_live(&mut session, reader, writer, stop).await;
    let frames_recorded = session.frames_recorded();
    let raw = session.output_path().to_owned();
    let closed = session.close();
    drop(session);

    let (end, fault) = match served {
        Ok(end) => (end, None),
        Err(e) => {
            warn!(error = %e, frames_recorded, "live stream failed");
            (StreamEnd::Disconnected, Some(e))
        }
    };
    if let Err(e) = closed {
        cleanup_files(&[raw]);
        return Err(match fault {
            Some(fault) => {
                warn!(error = %e, "failed to close live session");
                fault
            }
            None => e,
        });
    }
    info!(?end, frames_recorded, "live stream ended");

    let outcome = if frames_recorded == 0 {
        cleanup_files(&[raw]);
        LiveOutcome {
            end,
            frames_recorded,
            annotation: None,
            relay: None,
        }
    } else {
        let (annotation, relay) =
            annotate_recording(raw, writer, pipeline, reference, annotated_out, end).await?;
        LiveOutcome {
            end,
            frames_recorded,
            annotation,
            relay: Some(relay),
        }
    };

    match fault {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

async fn annotate_recording<W>(
    raw: PathBuf,
    writer: &mut W,
    pipeline: BatchPipeline,
    reference: &Path,
    annotated_out: PathBuf,
    end: StreamEnd,
) -> Result<(Option<AnnotationOutput>, RelayEnd), Error>
where
    W: AsyncWrite + Unpin,
{
    let reference = reference.to_owned();
    let job_raw = raw.clone();
    let job = Job::spawn("annotate-recording", move |ctx| {
        Ok(pipeline.annotate(
            &reference,
            &job_raw,
            &annotated_out,
            ctx,
            ctx.cancel_token(),
        )?)
    })?;

    let forwarding = end == StreamEnd::Finished;
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut annotation = None;
    let slot = &mut annotation;
    let relay = job.relay(vec![raw], move |event: Event<AnnotationOutput>| {
        if let Event::Result(output) = &event {
            *slot = Some(output.clone());
        }
        if forwarding {
            forward(&tx, &event)
        } else {
            ControlFlow::Continue(())
        }
    });
    // owns the receiver, so a failed write is seen by the relay as a closed
    // channel
    let drain = async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_line(writer, &line).await {
                debug!(error = %e, "client went away during annotation");
                break;
            }
        }
    };
    let (relay, ()) = tokio::join!(relay, drain);
    Ok((annotation, relay))
}

#[cfg(test)]
mod tests {
    use super::{
        forward, run_live_session, serve_frames, serve_live, StreamEnd, MAX_FRAME_BYTES,
    };
    use crate::{
        compare::Comparator,
        config::{ComparatorConfig, LiveConfig, PipelineConfig},
        error::Error,
        event::Event,
        frame::FrameSize,
        job::{CancelToken, RelayEnd},
        pipeline::BatchPipeline,
        session::LiveSession,
        testing::{color_extractors, png_bytes, solid, MemoryBackend},
    };
    use serde_json::Value;
    use std::{
        io,
        ops::ControlFlow,
        path::Path,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
    };
    use tokio::{
        io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadBuf},
        sync::mpsc,
    };

    const SIZE: FrameSize = FrameSize::new(8, 6);

    /// Fails every read, like a reset connection.
    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset",
            )))
        }
    }

    fn session(backend: &MemoryBackend, dir: &Path) -> LiveSession {
        LiveSession::open(
            Arc::new(backend.clone()),
            color_extractors().as_ref(),
            Comparator::new(ComparatorConfig::default()),
            Path::new("reference"),
            &LiveConfig {
                output_dir: dir.to_owned(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::default();
        backend.insert("reference", vec![solid(SIZE, [60, 90, 0]); 3]);
        backend
    }

    fn pipeline(backend: &MemoryBackend) -> BatchPipeline {
        BatchPipeline::new(
            Arc::new(backend.clone()),
            color_extractors(),
            Comparator::new(ComparatorConfig::default()),
            PipelineConfig::default(),
        )
    }

    fn message(bytes: &[u8]) -> Vec<u8> {
        let mut out = (bytes.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(bytes);
        out
    }

    fn lines(bytes: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(bytes)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn answers_each_frame_and_stops_at_end_marker() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let mut session = session(&backend, dir.path());

        let frame = png_bytes(&solid(SIZE, [60, 90, 0]));
        let mut input = Vec::new();
        input.extend(message(&frame));
        input.extend(message(b"garbage"));
        input.extend(message(&frame));
        input.extend(message(&[]));
        input.extend(message(&frame));

        let mut output = Vec::new();
        let end = serve_live(
            &mut session,
            &mut input.as_slice(),
            &mut output,
            &CancelToken::default(),
        )
        .await
        .unwrap();

        assert_eq!(end, StreamEnd::Finished);
        let replies = lines(&output);
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0]["score"], 1.0);
        assert_eq!(replies[1]["error"], "Invalid frame received.");
        assert_eq!(replies[2]["wrong_keypoints"], Value::Array(vec![]));
        assert_eq!(session.frames_recorded(), 2);
    }

    #[tokio::test]
    async fn eof_is_a_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let mut session = session(&backend, dir.path());
        let frame = png_bytes(&solid(SIZE, [60, 90, 0]));
        let mut truncated = message(&frame);
        truncated.truncate(truncated.len() / 2);

        let mut output = Vec::new();
        let end = serve_live(
            &mut session,
            &mut truncated.as_slice(),
            &mut output,
            &CancelToken::default(),
        )
        .await
        .unwrap();
        assert_eq!(end, StreamEnd::Disconnected);
        assert!(output.is_empty());
        assert_eq!(session.frames_recorded(), 0);
    }

    #[tokio::test]
    async fn oversized_frame_is_skipped_and_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let mut session = session(&backend, dir.path());
        let frame = png_bytes(&solid(SIZE, [60, 90, 0]));
        let limit = frame.len();

        let mut input = Vec::new();
        input.extend(message(&frame));
        input.extend(message(&vec![7; limit + 1]));
        input.extend(message(&frame));
        input.extend(message(&[]));

        let mut output = Vec::new();
        let end = serve_frames(
            &mut session,
            &mut input.as_slice(),
            &mut output,
            &CancelToken::default(),
            limit,
        )
        .await
        .unwrap();

        assert_eq!(end, StreamEnd::Finished);
        let replies = lines(&output);
        assert_eq!(replies.len(), 3);
        assert_eq!(
            replies[1]["error"],
            Error::FrameTooLarge(limit + 1, limit).to_string()
        );
        assert_eq!(replies[2]["score"], 1.0);
        assert_eq!(session.frames_recorded(), 2);
    }

    #[tokio::test]
    async fn cancelled_stop_interrupts_serving() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let mut session = session(&backend, dir.path());
        let stop = CancelToken::default();
        stop.cancel();

        let (_client, mut server) = tokio::io::duplex(64);
        let end = serve_live(&mut session, &mut server, &mut Vec::<u8>::new(), &stop)
            .await
            .unwrap();
        assert_eq!(end, StreamEnd::Interrupted);
    }

    #[tokio::test]
    async fn live_session_is_annotated_then_raw_recording_removed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let session = session(&backend, dir.path());
        let raw = session.output_path().to_owned();
        let annotated = dir.path().join("annotated.mem");

        let (mut client, server) = tokio::io::duplex(1 << 20);
        let frame = png_bytes(&solid(SIZE, [60, 90, 0]));
        for _ in 0..5 {
            client.write_all(&message(&frame)).await.unwrap();
        }
        client.write_all(&message(&[])).await.unwrap();

        let (mut reader, mut writer) = tokio::io::split(server);
        let outcome = run_live_session(
            session,
            &mut reader,
            &mut writer,
            pipeline(&backend),
            Path::new("reference"),
            annotated.clone(),
            &CancelToken::default(),
        )
        .await
        .unwrap();
        drop(writer);
        drop(reader);

        assert_eq!(outcome.end, StreamEnd::Finished);
        assert_eq!(outcome.frames_recorded, 5);
        assert_eq!(outcome.relay, Some(RelayEnd::Done));
        let annotation = outcome.annotation.unwrap();
        assert_eq!(annotation.summary.compared_frames, 5);
        assert_eq!(backend.frames(&annotated).unwrap().len(), 5);
        assert!(!raw.exists());

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        let received = lines(&received);
        assert!(received[..5].iter().all(|r| r["score"] == 1.0));
        let events = &received[5..];
        assert!(events.iter().any(|e| e["type"] == "result"));
        assert_eq!(events.last().unwrap()["type"], "done");
    }

    #[tokio::test]
    async fn oversized_header_then_hangup_still_annotates() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let session = session(&backend, dir.path());
        let raw = session.output_path().to_owned();
        let annotated = dir.path().join("annotated.mem");

        let frame = png_bytes(&solid(SIZE, [60, 90, 0]));
        let mut input = Vec::new();
        input.extend(message(&frame));
        input.extend(message(&frame));
        input.extend(((MAX_FRAME_BYTES + 1) as u32).to_be_bytes());

        let outcome = run_live_session(
            session,
            &mut input.as_slice(),
            &mut Vec::<u8>::new(),
            pipeline(&backend),
            Path::new("reference"),
            annotated.clone(),
            &CancelToken::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.end, StreamEnd::Disconnected);
        assert_eq!(outcome.frames_recorded, 2);
        assert!(outcome.annotation.is_some());
        assert_eq!(backend.frames(&annotated).unwrap().len(), 2);
        assert!(!raw.exists());
    }

    #[tokio::test]
    async fn interrupt_closes_and_annotates_recording() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let session = session(&backend, dir.path());
        let raw = session.output_path().to_owned();
        let annotated = dir.path().join("annotated.mem");

        let (client, server) = tokio::io::duplex(1 << 20);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let frame = png_bytes(&solid(SIZE, [60, 90, 0]));
        for _ in 0..2 {
            client_write.write_all(&message(&frame)).await.unwrap();
        }

        let (mut reader, mut writer) = tokio::io::split(server);
        let stop = CancelToken::default();
        let interrupt = async {
            let mut replies = BufReader::new(&mut client_read).lines();
            for _ in 0..2 {
                replies.next_line().await.unwrap().unwrap();
            }
            stop.cancel();
        };
        let (outcome, ()) = tokio::join!(
            run_live_session(
                session,
                &mut reader,
                &mut writer,
                pipeline(&backend),
                Path::new("reference"),
                annotated.clone(),
                &stop,
            ),
            interrupt
        );
        let outcome = outcome.unwrap();

        assert_eq!(outcome.end, StreamEnd::Interrupted);
        assert_eq!(outcome.frames_recorded, 2);
        assert_eq!(outcome.relay, Some(RelayEnd::Done));
        assert_eq!(backend.frames(&annotated).unwrap().len(), 2);
        assert!(!raw.exists());
        drop(client_write);
    }

    #[tokio::test]
    async fn transport_fault_annotates_recorded_frames_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let session = session(&backend, dir.path());
        let raw = session.output_path().to_owned();
        let annotated = dir.path().join("annotated.mem");

        let frame = png_bytes(&solid(SIZE, [60, 90, 0]));
        let mut input = Vec::new();
        input.extend(message(&frame));
        input.extend(message(&frame));
        let mut reader = input.as_slice().chain(BrokenPipe);

        let result = run_live_session(
            session,
            &mut reader,
            &mut Vec::<u8>::new(),
            pipeline(&backend),
            Path::new("reference"),
            annotated.clone(),
            &CancelToken::default(),
        )
        .await;

        assert!(matches!(result, Err(Error::TransportIo(_))));
        assert_eq!(backend.frames(&annotated).unwrap().len(), 2);
        assert!(!raw.exists());
    }

    #[tokio::test]
    async fn disconnect_without_frames_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let session = session(&backend, dir.path());
        let raw = session.output_path().to_owned();

        let outcome = run_live_session(
            session,
            &mut &b""[..],
            &mut Vec::<u8>::new(),
            pipeline(&backend),
            Path::new("reference"),
            dir.path().join("annotated.mem"),
            &CancelToken::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.end, StreamEnd::Disconnected);
        assert!(outcome.annotation.is_none());
        assert!(!raw.exists());
    }

    #[test]
    fn forwarding_stops_once_client_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let event: Event<()> = Event::Done;
        assert_eq!(forward(&tx, &event), ControlFlow::Continue(()));
        drop(rx);
        assert_eq!(forward(&tx, &event), ControlFlow::Break(()));
    }
}
