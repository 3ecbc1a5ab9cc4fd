use crate::error::EngineError;
use crate::model::ResolvedStream;
use crate::process::SupervisedChild;
use bytes::{Bytes, BytesMut};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
/// 小于该大小的帧视为解码失败
const MIN_FRAME_BYTES: usize = 1000;
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, Clone)]
pub struct PreviewOptions {
    pub ffmpeg_binary: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl PreviewOptions {
    pub fn new(ffmpeg_binary: impl Into<String>) -> Self {
        Self {
            ffmpeg_binary: ffmpeg_binary.into(),
            width: 180,
            height: 320,
            fps: 2,
        }
    }

    fn command(&self, stream: &ResolvedStream) -> Command {
        let (w, h) = (self.width, self.height);
        let mut cmd = Command::new(&self.ffmpeg_binary);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        cmd.arg("-i").arg(&stream.url);
        cmd.arg("-an");
        cmd.arg("-vf").arg(format!(
            "fps={},scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}",
            self.fps
        ));
        cmd.arg("-q:v").arg("5");
        cmd.arg("-f").arg("image2pipe").arg("-vcodec").arg("mjpeg").arg("-");
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        cmd
    }
}

/// 实时预览
///
/// 独立的 ffmpeg 进程把直播流解码成小尺寸 MJPEG 帧输出到 stdout，
/// 最新一帧通过 watch 通道发布。读取方只看到最新帧，不会拖慢解码，也不影响录制。
pub struct PreviewFeed {
    handle: String,
    frames: watch::Receiver<Option<Bytes>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PreviewFeed {
    pub fn attach(
        handle: &str,
        stream: &ResolvedStream,
        options: &PreviewOptions,
    ) -> Result<Self, EngineError> {
        let mut child = SupervisedChild::spawn(options.command(stream), &options.ffmpeg_binary)?;
        let stdout = child.take_stdout().ok_or_else(|| {
            EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "preview stdout not captured",
            ))
        })?;

        let (tx, frames) = watch::channel(None);
        let cancel = CancellationToken::new();
        info!("Preview attached [{}]", handle);
        let task = tokio::spawn(pump_frames(
            handle.to_string(),
            child,
            stdout,
            tx,
            cancel.clone(),
        ));

        Ok(Self {
            handle: handle.to_string(),
            frames,
            cancel,
            task,
        })
    }

    /// 解码帧通道，始终保存最新一帧
    pub fn frames(&self) -> watch::Receiver<Option<Bytes>> {
        self.frames.clone()
    }

    pub fn latest_frame(&self) -> Option<Bytes> {
        self.frames.borrow().clone()
    }

    /// 解码进程自行结束后返回 false
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn detach(self) {
        self.cancel.cancel();
        if tokio::time::timeout(Duration::from_secs(3), self.task)
            .await
            .is_err()
        {
            warn!("Preview [{}] did not shut down in time", self.handle);
        }
        info!("Preview detached [{}]", self.handle);
    }
}

async fn pump_frames(
    handle: String,
    mut child: SupervisedChild,
    mut stdout: tokio::process::ChildStdout,
    tx: watch::Sender<Option<Bytes>>,
    cancel: CancellationToken,
) {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = stdout.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!("Preview decoder for [{}] closed its output", handle);
                    break;
                }
                Ok(_) => {
                    for frame in split_jpeg_frames(&mut buf) {
                        if frame.len() < MIN_FRAME_BYTES {
                            failures += 1;
                        } else {
                            failures = 0;
                            tx.send_replace(Some(frame));
                        }
                    }
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        warn!("Preview [{}] produced {} bad frames in a row", handle, failures);
                        break;
                    }
                }
                Err(e) => {
                    warn!("Preview read error [{}]: {}", handle, e);
                    break;
                }
            }
        }
    }

    child.terminate(Duration::from_millis(500)).await;
}

/// 取出 `buf` 中所有完整的 JPEG (SOI..EOI)，保留不完整的尾部
fn split_jpeg_frames(buf: &mut BytesMut) -> Vec<Bytes> {
    let mut frames = Vec::new();
    loop {
        let Some(start) = find(buf, &JPEG_SOI, 0) else {
            // 末尾的 0xFF 可能是下一个标记的前半部分，保留
            let keep = usize::from(buf.last() == Some(&0xFF));
            let drop_len = buf.len() - keep;
            let _ = buf.split_to(drop_len);
            break;
        };
        let Some(end) = find(buf, &JPEG_EOI, start + 2) else {
            let _ = buf.split_to(start);
            break;
        };
        let _ = buf.split_to(start);
        frames.push(buf.split_to(end - start + 2).freeze());
    }
    frames
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == needle)
        .map(|i| i + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = JPEG_SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&JPEG_EOI);
        v
    }

    #[test]
    fn splits_complete_frames_and_keeps_tail() {
        let mut data = b"noise".to_vec();
        data.extend(jpeg(b"one"));
        data.extend(jpeg(b"two"));
        data.extend_from_slice(&JPEG_SOI);
        data.extend_from_slice(b"par");
        let mut buf = BytesMut::from(&data[..]);

        let frames = split_jpeg_frames(&mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &jpeg(b"one")[..]);
        assert_eq!(&frames[1][..], &jpeg(b"two")[..]);

        let mut expected_tail = JPEG_SOI.to_vec();
        expected_tail.extend_from_slice(b"par");
        assert_eq!(&buf[..], &expected_tail[..]);

        buf.extend_from_slice(b"tial");
        buf.extend_from_slice(&JPEG_EOI);
        let frames = split_jpeg_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn garbage_is_discarded() {
        let mut buf = BytesMut::from(&b"no markers here"[..]);
        assert!(split_jpeg_frames(&mut buf).is_empty());
        assert!(buf.is_empty());

        let mut buf = BytesMut::from(&[0x00, 0x01, 0xFF][..]);
        assert!(split_jpeg_frames(&mut buf).is_empty());
        assert_eq!(&buf[..], &[0xFF]);
    }

    #[test]
    fn command_targets_stdout_mjpeg() {
        let options = PreviewOptions::new("ffmpeg");
        let stream = ResolvedStream {
            url: "https://cdn/p.flv".to_string(),
            expires_hint: None,
            quality: crate::model::Quality::Low,
            title: String::new(),
            viewers: 0,
        };
        let cmd = options.command(&stream);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args.last().map(String::as_str), Some("-"));
        assert!(args.iter().any(|a| a == "image2pipe"));
        assert!(args.iter().any(|a| a.starts_with("fps=2,scale=180:320")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn feed_publishes_frames_from_process() {
        // 向 stdout 输出一个 1.2 KB 的假 "JPEG"，然后空闲
        let script = "printf '\\377\\330'; head -c 1200 /dev/zero; printf '\\377\\331'; sleep 5";
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).stdout(Stdio::piped());
        let mut child = SupervisedChild::spawn(cmd, "sh").unwrap();
        let stdout = child.take_stdout().unwrap();
        let (tx, mut rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump_frames("p".to_string(), child, stdout, tx, cancel.clone()));

        let frame = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap()
            .clone()
            .unwrap();
        assert_eq!(frame.len(), 1204);
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
