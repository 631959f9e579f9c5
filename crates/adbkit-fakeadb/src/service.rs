//! The ADB service front end: length-prefixed requests answered with `OKAY` or `FAIL`.

use std::io;
use std::sync::{Arc, Weak};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::device::DeviceState;
use crate::hub::{continue_handler, ChangeHandler, ChangeHandlerFactory, HandlerResult};
use crate::server::ServerShared;
use crate::session::{acquire_session, JdwpSession};
use crate::{FakeAdbError, Result};

/// Requests longer than this are rejected.
const MAX_REQUEST_LEN: usize = 0xFFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Service {
    Transport(String),
    Jdwp(i32),
    TrackJdwp,
    Logcat,
    Unsupported(String),
}

impl Service {
    pub(crate) fn parse(request: &str) -> Self {
        if let Some(serial) = request.strip_prefix("host:transport:") {
            return Self::Transport(serial.to_string());
        }
        if let Some(pid) = request.strip_prefix("jdwp:") {
            return match pid.parse() {
                Ok(pid) => Self::Jdwp(pid),
                Err(_) => Self::Unsupported(request.to_string()),
            };
        }
        match request {
            "track-jdwp" => Self::TrackJdwp,
            "logcat" | "shell:logcat" => Self::Logcat,
            _ => Self::Unsupported(request.to_string()),
        }
    }

    fn needs_device(&self) -> bool {
        matches!(self, Self::Jdwp(_) | Self::TrackJdwp | Self::Logcat)
    }
}

/// Reads one `<4 hex digits><request>` message. Returns `Ok(None)` when the peer closed.
pub(crate) async fn read_request<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = std::str::from_utf8(&prefix)
        .ok()
        .and_then(|hex| usize::from_str_radix(hex, 16).ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid request length prefix {prefix:?}"),
            )
        })?;
    if len > MAX_REQUEST_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "request too long").into());
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    String::from_utf8(body)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err).into())
}

pub(crate) fn length_prefixed(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{:04x}", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out
}

pub(crate) async fn write_okay<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(b"OKAY").await?;
    writer.flush().await
}

pub(crate) async fn write_fail<W>(writer: &mut W, message: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut out = b"FAIL".to_vec();
    out.extend_from_slice(&length_prefixed(message.as_bytes()));
    writer.write_all(&out).await?;
    writer.flush().await
}

/// Serves one accepted connection until its service completes or the peer goes away.
pub(crate) async fn handle_connection(mut stream: TcpStream, shared: Arc<ServerShared>) -> Result<()> {
    let mut device: Option<Arc<DeviceState>> = None;
    loop {
        let Some(request) = read_request(&mut stream).await? else {
            return Ok(());
        };
        tracing::debug!(target: "adbkit.fakeadb", request = %request, "service request");
        let service = Service::parse(&request);

        let selected = match (&device, service.needs_device()) {
            (Some(device), true) => Some(Arc::clone(device)),
            (None, true) => {
                write_fail(&mut stream, "no device selected").await?;
                return Ok(());
            }
            (_, false) => None,
        };

        match (service, selected) {
            (Service::Transport(serial), _) => match shared.device(&serial) {
                Some(found) if found.is_online() => {
                    write_okay(&mut stream).await?;
                    device = Some(found);
                }
                _ => {
                    write_fail(&mut stream, &FakeAdbError::UnknownDevice(serial).to_string())
                        .await?;
                    return Ok(());
                }
            },
            (Service::Jdwp(pid), Some(device)) => return serve_jdwp(stream, device, pid, &shared).await,
            (Service::TrackJdwp, Some(device)) => return serve_track_jdwp(stream, device).await,
            (Service::Logcat, Some(device)) => return serve_logcat(stream, device).await,
            _ => {
                write_fail(
                    &mut stream,
                    &FakeAdbError::UnsupportedService(request).to_string(),
                )
                .await?;
                return Ok(());
            }
        }
    }
}

async fn serve_jdwp(
    mut stream: TcpStream,
    device: Arc<DeviceState>,
    pid: i32,
    shared: &ServerShared,
) -> Result<()> {
    let Some(client) = device.client(pid) else {
        write_fail(&mut stream, &FakeAdbError::UnknownClient(pid).to_string()).await?;
        return Ok(());
    };
    let slot = match acquire_session(&device, &client, &shared.config.session).await {
        Ok(slot) => slot,
        Err(err @ FakeAdbError::SessionConflict { .. }) => {
            write_fail(&mut stream, &err.to_string()).await?;
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    // Acknowledge only once the process is ours.
    write_okay(&mut stream).await?;

    let (reader, writer) = stream.into_split();
    let mut session = JdwpSession::new(
        device,
        client,
        Arc::clone(&shared.handlers),
        writer,
        shared.config.wire,
    );
    let result = session.run(reader, slot.handle().clone()).await;
    drop(slot);
    result
}

/// Streams `<len><pid>\n...` whenever the device's process list changes.
async fn serve_track_jdwp(stream: TcpStream, device: Arc<DeviceState>) -> Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let factory = Arc::new(TrackJdwp {
        device: Arc::downgrade(&device),
        writer: Arc::clone(&writer),
    });
    let Some(queue) = device.subscribe(factory) else {
        let mut writer = writer.lock().await;
        write_fail(&mut *writer, &FakeAdbError::UnknownDevice(device.serial().to_string()).to_string())
            .await?;
        return Ok(());
    };
    {
        let mut writer = writer.lock().await;
        write_okay(&mut *writer).await?;
        writer.write_all(&pid_list_frame(&device)).await?;
        writer.flush().await?;
    }
    drop(device);

    let mut probe = [0u8; 1];
    tokio::select! {
        _ = queue.run() => {}
        _ = reader.read(&mut probe) => {}
    }
    Ok(())
}

fn pid_list_frame(device: &DeviceState) -> Vec<u8> {
    let list: String = device
        .client_pids()
        .iter()
        .map(|pid| format!("{pid}\n"))
        .collect();
    length_prefixed(list.as_bytes())
}

struct TrackJdwp {
    device: Weak<DeviceState>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl ChangeHandlerFactory for TrackJdwp {
    fn client_list_changed(&self) -> ChangeHandler {
        let device = self.device.clone();
        let writer = Arc::clone(&self.writer);
        Box::pin(async move {
            let Some(device) = device.upgrade() else {
                return HandlerResult::Stop;
            };
            let frame = pid_list_frame(&device);
            drop(device);
            let mut writer = writer.lock().await;
            match write_frame(&mut *writer, &frame).await {
                Ok(()) => HandlerResult::Continue,
                Err(_) => HandlerResult::Stop,
            }
        })
    }
}

/// Dumps the buffered log, then follows new messages.
async fn serve_logcat(stream: TcpStream, device: Arc<DeviceState>) -> Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let factory = Arc::new(LogcatFollow {
        writer: Arc::clone(&writer),
    });
    let (backlog, queue) = device.follow_logcat(factory);
    {
        let mut writer = writer.lock().await;
        write_okay(&mut *writer).await?;
        for message in &backlog {
            writer.write_all(format!("{message}\n").as_bytes()).await?;
        }
        writer.flush().await?;
    }
    drop(device);

    let Some(queue) = queue else {
        return Ok(());
    };
    let mut probe = [0u8; 1];
    tokio::select! {
        _ = queue.run() => {}
        _ = reader.read(&mut probe) => {}
    }
    Ok(())
}

struct LogcatFollow {
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl ChangeHandlerFactory for LogcatFollow {
    fn client_list_changed(&self) -> ChangeHandler {
        continue_handler()
    }

    fn logcat_message_added(&self, message: &str) -> ChangeHandler {
        let line = format!("{message}\n").into_bytes();
        let writer = Arc::clone(&self.writer);
        Box::pin(async move {
            let mut writer = writer.lock().await;
            match write_frame(&mut *writer, &line).await {
                Ok(()) => HandlerResult::Continue,
                Err(_) => HandlerResult::Stop,
            }
        })
    }
}

async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_services() {
        assert_eq!(
            Service::parse("host:transport:emulator-5554"),
            Service::Transport("emulator-5554".into())
        );
        assert_eq!(Service::parse("jdwp:1234"), Service::Jdwp(1234));
        assert_eq!(Service::parse("track-jdwp"), Service::TrackJdwp);
        assert_eq!(Service::parse("shell:logcat"), Service::Logcat);
        assert_eq!(
            Service::parse("jdwp:abc"),
            Service::Unsupported("jdwp:abc".into())
        );
        assert_eq!(
            Service::parse("host:features"),
            Service::Unsupported("host:features".into())
        );
    }

    #[tokio::test]
    async fn reads_length_prefixed_requests() {
        let mut input: &[u8] = b"000atrack-jdwp0004jdwp";
        assert_eq!(
            read_request(&mut input).await.unwrap().as_deref(),
            Some("track-jdwp")
        );
        assert_eq!(read_request(&mut input).await.unwrap().as_deref(), Some("jdwp"));
        assert_eq!(read_request(&mut input).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_non_hex_prefix() {
        let mut input: &[u8] = b"zzzzjunk";
        let err = read_request(&mut input).await.unwrap_err();
        assert!(matches!(err, FakeAdbError::Io(ref e) if e.kind() == io::ErrorKind::InvalidData));
    }

    #[tokio::test]
    async fn fail_carries_a_length_prefixed_message() {
        let mut out = Vec::new();
        write_fail(&mut out, "No client exists for pid: 5").await.unwrap();
        assert_eq!(out, b"FAIL001bNo client exists for pid: 5".to_vec());
    }

    #[test]
    fn frames_are_hex_length_prefixed() {
        assert_eq!(length_prefixed(b"12\n34\n"), b"000612\n34\n".to_vec());
        assert_eq!(length_prefixed(b""), b"0000".to_vec());
    }
}
