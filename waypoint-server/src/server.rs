use crate::app::App;
use crate::router;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use waypoint_core::ipc::{self, WaypointRequest, WaypointResponse};

pub async fn run_unix_server(
    socket_path: &str,
    app: Arc<App>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::info!("IPC Server listening on {}", socket_path);

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, _) = res?;
                let app = app.clone();
                tokio::spawn(async move {
                    let (read, write) = stream.into_split();
                    // 4-byte little-endian length prefix + MessagePack payload
                    let le_codec = || LengthDelimitedCodec::builder().little_endian().new_codec();
                    let mut framed_read = FramedRead::new(read, le_codec());
                    let mut framed_write = FramedWrite::new(write, le_codec());

                    while let Some(frame) = framed_read.next().await {
                        let bytes_mut = match frame {
                            Ok(b) => b,
                            Err(e) => {
                                tracing::error!("Frame error: {}", e);
                                break;
                            }
                        };

                        let response = match ipc::decode::<WaypointRequest>(&bytes_mut) {
                            Ok(request) => router::handle_request(request, &app).await,
                            Err(e) => WaypointResponse::err(format!("Deserialization error: {}", e)),
                        };

                        match ipc::encode(&response) {
                            Ok(resp_bytes) => {
                                if let Err(e) = framed_write.send(Bytes::from(resp_bytes)).await {
                                    tracing::error!("Failed to send response: {}", e);
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::error!("Failed to serialize response: {}", e);
                                break;
                            }
                        }
                    }
                });
            }
            _ = shutdown.recv() => {
                tracing::info!("Shutting down IPC server...");
                break;
            }
        }
    }

    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    Ok(())
}
