use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use qr_guard_common::config::CameraConfig;
use qr_guard_common::event::CameraError;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::FrameSource;
use crate::frame::Frame;

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Largest part (headers or JPEG body) kept while waiting for its end marker.
const MAX_PART_SIZE: usize = 8 * 1024 * 1024;

/// Latest JPEG published by the reader task, tagged with its sequence number.
type LatestJpeg = Option<(u64, Bytes)>;

/// Network camera publishing an MJPEG multipart stream over HTTP.
///
/// Acquiring the camera opens the HTTP stream and spawns one reader task that
/// keeps only the newest complete JPEG. The scan loop samples it at its own
/// pace, so slow decodes drop frames instead of queueing them.
pub struct MjpegCamera {
    url: String,
    client: reqwest::Client,
    first_frame_timeout: Duration,
    reader: Option<JoinHandle<()>>,
    latest: Option<watch::Receiver<LatestJpeg>>,
    last_seq: u64,
}

impl MjpegCamera {
    pub fn new(config: &CameraConfig) -> Result<Self, CameraError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| CameraError::Other(e.to_string()))?;
        Ok(Self {
            url: config.url.clone(),
            client,
            first_frame_timeout: Duration::from_secs(config.first_frame_timeout_secs),
            reader: None,
            latest: None,
            last_seq: 0,
        })
    }

    fn reader_finished(&self) -> bool {
        self.reader.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl FrameSource for MjpegCamera {
    async fn acquire(&mut self) -> Result<(), CameraError> {
        // Exactly one capture may be open.
        self.release();

        info!(url = self.url, "connecting to camera stream");
        let response = tokio::time::timeout(
            self.first_frame_timeout,
            self.client.get(&self.url).send(),
        )
        .await
        .map_err(|_| CameraError::Aborted)?
        .map_err(classify_request_error)?;

        if !response.status().is_success() {
            return Err(classify_status(response.status()));
        }

        let (tx, mut rx) = watch::channel::<LatestJpeg>(None);
        let handle = tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut parser = MjpegParser::new();
            let mut seq: u64 = 0;

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "camera stream error");
                        return;
                    }
                };
                for jpeg in parser.push(&chunk) {
                    seq += 1;
                    if tx.send(Some((seq, jpeg))).is_err() {
                        return;
                    }
                }
            }
            info!("camera stream ended");
        });
        self.reader = Some(handle);
        self.last_seq = 0;

        match tokio::time::timeout(self.first_frame_timeout, rx.changed()).await {
            Ok(Ok(())) => {
                self.latest = Some(rx);
                info!(url = self.url, "camera ready");
                Ok(())
            }
            Ok(Err(_)) => {
                warn!("camera stream closed before the first frame");
                self.release();
                Err(CameraError::Aborted)
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.first_frame_timeout.as_secs(),
                    "no frame from camera in time"
                );
                self.release();
                Err(CameraError::Aborted)
            }
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        let Some(rx) = self.latest.as_ref() else {
            return Err(CameraError::Other("camera is not acquired".into()));
        };

        let latest = rx.borrow().clone();
        if let Some((seq, jpeg)) = latest {
            if seq != self.last_seq {
                self.last_seq = seq;
                return match Frame::from_encoded(&jpeg, seq) {
                    Ok(frame) => Ok(Some(frame)),
                    Err(e) => {
                        warn!(error = %e, seq, "failed to decode camera JPEG, skipping frame");
                        Ok(None)
                    }
                };
            }
        }

        if self.reader_finished() {
            return Err(CameraError::Aborted);
        }
        Ok(None)
    }

    fn release(&mut self) {
        if let Some(handle) = self.reader.take() {
            handle.abort();
            debug!(url = self.url, "camera capture released");
        }
        self.latest = None;
    }

    fn is_acquired(&self) -> bool {
        self.reader.is_some()
    }

    fn name(&self) -> &str {
        "mjpeg-camera"
    }
}

impl Drop for MjpegCamera {
    fn drop(&mut self) {
        self.release();
    }
}

fn classify_request_error(e: reqwest::Error) -> CameraError {
    if e.is_timeout() {
        CameraError::Aborted
    } else if e.is_connect() {
        CameraError::NoDevice
    } else {
        CameraError::Other(e.to_string())
    }
}

fn classify_status(status: StatusCode) -> CameraError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CameraError::PermissionDenied,
        StatusCode::NOT_FOUND | StatusCode::GONE => CameraError::NoDevice,
        other => CameraError::Other(format!("camera responded with HTTP status {other}")),
    }
}

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for `multipart/x-mixed-replace` MJPEG bodies.
pub(crate) struct MjpegParser {
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
    max_part: usize,
}

impl MjpegParser {
    pub(crate) fn new() -> Self {
        Self::with_max_part(MAX_PART_SIZE)
    }

    pub(crate) fn with_max_part(max_part: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
            max_part,
        }
    }

    /// Drop a part that outgrew the limit and resynchronise on the next boundary.
    fn discard_oversized(&mut self) {
        warn!(
            buffered = self.buffer.len(),
            limit = self.max_part,
            "MJPEG part too large, discarding"
        );
        self.buffer.clear();
        self.jpeg_start = 0;
        self.state = ParseState::SeekingBoundary;
    }

    /// Feed one chunk of the body; returns every JPEG completed by it.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut completed = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        let _ = self.buffer.split_to(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep a tail in case the boundary spans chunks
                        if self.buffer.len() > BOUNDARY.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - BOUNDARY.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        if self.buffer.len() > self.max_part {
                            self.discard_oversized();
                        }
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.jpeg_start..], BOUNDARY)
                    else {
                        if self.buffer.len() > self.max_part {
                            self.discard_oversized();
                        } else {
                            self.jpeg_start = self.buffer.len().saturating_sub(BOUNDARY.len());
                        }
                        break;
                    };
                    let jpeg_end = self.jpeg_start + pos;
                    // Strip trailing \r\n before boundary
                    let end = if self.buffer[..jpeg_end].ends_with(b"\r\n") {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };

                    let mut part = self.buffer.split_to(jpeg_end + BOUNDARY.len());
                    part.truncate(end);
                    if !part.is_empty() {
                        completed.push(part.freeze());
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        completed
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    fn jpeg(shade: u8) -> Vec<u8> {
        let img = GrayImage::from_pixel(16, 16, Luma([shade]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut buf, ImageFormat::Jpeg)
            .unwrap();
        buf.into_inner()
    }

    fn part(body: &[u8]) -> Vec<u8> {
        let mut out = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }

    fn config(url: String) -> CameraConfig {
        CameraConfig {
            url,
            connect_timeout_secs: 2,
            first_frame_timeout_secs: 2,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn parser_splits_parts() {
        let mut parser = MjpegParser::new();
        let mut body = part(b"AAAA");
        body.extend(part(b"BBBBBB"));
        body.extend_from_slice(BOUNDARY);

        let frames = parser.push(&body);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], b"AAAA");
        assert_eq!(&frames[1][..], b"BBBBBB");
    }

    #[test]
    fn parser_handles_boundary_across_chunks() {
        let mut parser = MjpegParser::new();
        let mut body = part(b"first-jpeg");
        body.extend_from_slice(BOUNDARY);

        let mut frames = Vec::new();
        for chunk in body.chunks(3) {
            frames.extend(parser.push(chunk));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"first-jpeg");
    }

    #[test]
    fn parser_waits_for_closing_boundary() {
        let mut parser = MjpegParser::new();
        assert!(parser.push(&part(b"partial")).is_empty());
        let frames = parser.push(BOUNDARY);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn parser_drops_part_without_closing_boundary() {
        let mut parser = MjpegParser::with_max_part(64);
        let mut runaway = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        runaway.extend(std::iter::repeat(0xAB).take(200));
        assert!(parser.push(&runaway).is_empty());
        assert!(parser.buffer.len() <= 64);

        // The stream recovers on the next well-formed part.
        let mut body = part(b"recovered");
        body.extend_from_slice(BOUNDARY);
        let frames = parser.push(&body);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"recovered");
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::FORBIDDEN), CameraError::PermissionDenied);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), CameraError::PermissionDenied);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), CameraError::NoDevice);
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            CameraError::Other(_)
        ));
    }

    #[tokio::test]
    async fn acquire_reads_frames_until_stream_ends() {
        let mut body = part(&jpeg(10));
        body.extend(part(&jpeg(240)));
        body.extend_from_slice(BOUNDARY);
        let app = Router::new().route(
            "/stream",
            get(move || {
                let body = body.clone();
                async move {
                    (
                        [(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame")],
                        body,
                    )
                        .into_response()
                }
            }),
        );
        let base = serve(app).await;

        let mut camera = MjpegCamera::new(&config(format!("{base}/stream"))).unwrap();
        camera.acquire().await.unwrap();
        assert!(camera.is_acquired());

        let frame = camera.next_frame().unwrap().expect("first frame");
        assert_eq!((frame.width(), frame.height()), (16, 16));

        // Once the body is exhausted the capture reports itself dead.
        let mut died = false;
        for _ in 0..50 {
            match camera.next_frame() {
                Err(e) => {
                    assert_eq!(e, CameraError::Aborted);
                    died = true;
                    break;
                }
                Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        assert!(died);

        camera.release();
        assert!(!camera.is_acquired());
    }

    #[tokio::test]
    async fn forbidden_is_permission_denied() {
        let app = Router::new().route("/stream", get(|| async { StatusCode::FORBIDDEN }));
        let base = serve(app).await;

        let mut camera = MjpegCamera::new(&config(format!("{base}/stream"))).unwrap();
        assert_eq!(camera.acquire().await.unwrap_err(), CameraError::PermissionDenied);
        assert!(!camera.is_acquired());
    }

    #[tokio::test]
    async fn refused_connection_is_no_device() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut camera = MjpegCamera::new(&config(format!("http://{addr}/stream"))).unwrap();
        assert_eq!(camera.acquire().await.unwrap_err(), CameraError::NoDevice);
    }

    #[tokio::test]
    async fn empty_stream_aborts_acquisition() {
        let app = Router::new().route("/stream", get(|| async { "" }));
        let base = serve(app).await;

        let mut camera = MjpegCamera::new(&config(format!("{base}/stream"))).unwrap();
        assert_eq!(camera.acquire().await.unwrap_err(), CameraError::Aborted);
        assert!(!camera.is_acquired());
    }

    #[test]
    fn next_frame_without_acquire_fails() {
        let mut camera = MjpegCamera::new(&config("http://127.0.0.1:1/".into())).unwrap();
        assert!(camera.next_frame().is_err());
    }
}
