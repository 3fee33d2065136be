//! Plugin transport.
//!
//! The build program comes from a child process spoken to over a versioned
//! RPC: length-delimited JSON frames on the child's stdio. The handshake
//! pins a magic cookie and negotiates the highest interface version both
//! sides speak; a mismatch is fatal and not retried. The child's stderr is
//! attached to the log aggregator, and a plugin death outside normal
//! shutdown surfaces as `PluginExit` - never a panic of the host.

pub mod proto;

use crate::build::group::BuildGroups;
use crate::log::{debug, log_message, trace};
use crate::plugin::proto::{
    BuildArgsGroupResponse, BuildArgsResponse, Handshake, Request, Response,
};
use crate::{err, EngineError, ErrContext, Error, Result};

use futures::{SinkExt, StreamExt};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

pub static DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
static HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
static PLUGIN_LOG_PREFIX: &str = "[plugin]";

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::new()
}

/// A framed RPC session over any byte stream pair.
pub struct PluginConnection<R, W> {
    reader: FramedRead<R, LengthDelimitedCodec>,
    writer: FramedWrite<W, LengthDelimitedCodec>,
    negotiated: u32,
    next_id: u64,
    call_timeout: Duration,
}

impl<R, W> PluginConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Performs the handshake and returns the ready connection.
    pub async fn handshake(read: R, write: W) -> Result<Self> {
        let mut connection = Self {
            reader: FramedRead::new(read, codec()),
            writer: FramedWrite::new(write, codec()),
            negotiated: 0,
            next_id: 0,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        };

        let host = Handshake::host();
        connection
            .send(&Request {
                id: 0,
                method: "handshake".to_string(),
                params: serde_json::to_value(&host)?,
            })
            .await?;

        let response = connection
            .recv(HANDSHAKE_TIMEOUT)
            .await
            .context("waiting for plugin handshake")?;
        let plugin: Handshake = decode(response)?;
        connection.negotiated = host.negotiate(&plugin)?;
        debug!(
            "plugin handshake complete, interface version {}",
            connection.negotiated
        );
        Ok(connection)
    }

    pub fn negotiated_version(&self) -> u32 {
        self.negotiated
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Retrieves the build program. v2 plugins deliver ordered groups; a v1
    /// answer is wrapped into a single group so the pipeline runs unchanged.
    pub async fn get_builds(&mut self) -> Result<BuildGroups> {
        match self.negotiated {
            2 => {
                let value = self.call("v2.GetBuilds", serde_json::Value::Null).await?;
                let response: BuildArgsGroupResponse =
                    serde_json::from_value(value).context("invalid v2.GetBuilds response")?;
                response.into_groups()
            }
            _ => {
                let value = self.call("v1.GetBuild", serde_json::Value::Null).await?;
                let response: BuildArgsResponse =
                    serde_json::from_value(value).context("invalid v1.GetBuild response")?;
                response.into_groups()
            }
        }
    }

    /// Best-effort goodbye before the child is reaped.
    pub async fn shutdown(&mut self) {
        self.next_id += 1;
        let _ = self
            .send(&Request {
                id: self.next_id,
                method: "shutdown".to_string(),
                params: serde_json::Value::Null,
            })
            .await;
    }

    async fn call(&mut self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        self.next_id += 1;
        let id = self.next_id;
        trace!("plugin call {} (id {})", method, id);

        self.send(&Request {
            id,
            method: method.to_string(),
            params,
        })
        .await?;

        let response = self.recv(self.call_timeout).await?;
        if response.id != id {
            return Err(EngineError::PluginExit(format!(
                "response id {} does not match request id {}",
                response.id, id
            ))
            .into());
        }
        if let Some(error) = response.error {
            return err!("plugin call `{}` failed - {}", method, error);
        }
        response
            .result
            .ok_or_else(|| EngineError::PluginExit(format!("empty response to `{}`", method)).into())
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        let bytes = serde_json::to_vec(request)?;
        self.writer
            .send(bytes::Bytes::from(bytes))
            .await
            .map_err(|e| EngineError::PluginExit(format!("write failed - {}", e)).into())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Response> {
        let frame = match tokio::time::timeout(timeout, self.reader.next()).await {
            Err(_) => {
                return Err(EngineError::Timeout {
                    op: "plugin-call".to_string(),
                    after: timeout,
                }
                .into())
            }
            Ok(None) => {
                return Err(
                    EngineError::PluginExit("unexpected end of stream".to_string()).into(),
                )
            }
            Ok(Some(frame)) => {
                frame.map_err(|e| EngineError::PluginExit(format!("read failed - {}", e)))?
            }
        };
        serde_json::from_slice(&frame).context("malformed plugin frame")
    }
}

fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    if let Some(error) = response.error {
        return Err(EngineError::PluginHandshake(error).into());
    }
    let value = response
        .result
        .ok_or_else(|| EngineError::PluginHandshake("empty handshake reply".to_string()))?;
    serde_json::from_value(value).context("malformed handshake reply")
}

/// A plugin child process plus its RPC session.
pub struct PluginHost {
    child: Child,
    connection:
        PluginConnection<tokio::process::ChildStdout, tokio::process::ChildStdin>,
    stderr_pump: Option<JoinHandle<()>>,
}

impl PluginHost {
    /// Spawns the plugin executable and completes the handshake. The
    /// child's stderr streams into the aggregator under a plugin prefix.
    pub async fn launch(program: &str, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch plugin `{}`", program))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::PluginHandshake("plugin stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::PluginHandshake("plugin stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::PluginHandshake("plugin stderr unavailable".into()))?;

        let stderr_pump = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log_message(PLUGIN_LOG_PREFIX, &line);
            }
        });

        match PluginConnection::handshake(stdout, stdin).await {
            Ok(connection) => Ok(Self {
                child,
                connection,
                stderr_pump: Some(stderr_pump),
            }),
            Err(err) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                stderr_pump.abort();
                Err(err)
            }
        }
    }

    pub fn negotiated_version(&self) -> u32 {
        self.connection.negotiated_version()
    }

    /// Fetches the build program; a dead plugin is reaped on failure.
    pub async fn get_builds(&mut self) -> Result<BuildGroups> {
        match self.connection.get_builds().await {
            Ok(groups) => Ok(groups),
            Err(err) => {
                let _ = self.child.kill().await;
                let _ = self.child.wait().await;
                Err(err)
            }
        }
    }

    /// Normal shutdown: goodbye message, then reap the child.
    pub async fn shutdown(mut self) -> Result<()> {
        self.connection.shutdown().await;
        let _ = self.child.kill().await;
        let status = self.child.wait().await.context("waiting for plugin exit")?;
        if let Some(pump) = self.stderr_pump.take() {
            let _ = pump.await;
        }
        trace!("plugin exited with {:?}", status.code());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::proto::{
        BuildArgs, BuildArgsGroup, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE,
    };
    use pretty_assertions::assert_eq;

    type ServerIo = tokio::io::DuplexStream;

    /// Speaks the plugin side of the protocol for tests.
    async fn fake_plugin(
        read: ServerIo,
        write: ServerIo,
        versions: Vec<u32>,
        cookie_value: &str,
        groups_by_version: impl Fn(u32) -> serde_json::Value,
    ) {
        let mut reader = FramedRead::new(read, codec());
        let mut writer = FramedWrite::new(write, codec());
        let mut negotiated = 0u32;

        while let Some(Ok(frame)) = reader.next().await {
            let request: Request = serde_json::from_slice(&frame).unwrap();
            let response = match request.method.as_str() {
                "handshake" => {
                    negotiated = *versions.iter().max().unwrap_or(&1);
                    Response {
                        id: request.id,
                        result: Some(
                            serde_json::to_value(Handshake {
                                magic_cookie_key: MAGIC_COOKIE_KEY.to_string(),
                                magic_cookie_value: cookie_value.to_string(),
                                protocol_version: negotiated,
                                supported_versions: versions.clone(),
                            })
                            .unwrap(),
                        ),
                        error: None,
                    }
                }
                "v1.GetBuild" | "v2.GetBuilds" => Response {
                    id: request.id,
                    result: Some(groups_by_version(negotiated)),
                    error: None,
                },
                "shutdown" => break,
                other => Response {
                    id: request.id,
                    result: None,
                    error: Some(format!("unknown method {}", other)),
                },
            };
            let bytes = serde_json::to_vec(&response).unwrap();
            writer.send(bytes::Bytes::from(bytes)).await.unwrap();
        }
    }

    fn build_args(app: &str) -> BuildArgs {
        BuildArgs {
            app: app.to_string(),
            build_type: "golang".to_string(),
            image: app.to_string(),
            image_tag: "t1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn v2_plugin_delivers_ordered_groups() {
        let (host_read, plugin_write) = tokio::io::duplex(64 * 1024);
        let (plugin_read, host_write) = tokio::io::duplex(64 * 1024);

        tokio::spawn(fake_plugin(
            plugin_read,
            plugin_write,
            vec![1, 2],
            MAGIC_COOKIE_VALUE,
            |_| {
                serde_json::to_value(BuildArgsGroupResponse {
                    args: vec![
                        BuildArgsGroup {
                            args: vec![build_args("x")],
                        },
                        BuildArgsGroup {
                            args: vec![build_args("y"), build_args("z")],
                        },
                    ],
                })
                .unwrap()
            },
        ));

        let mut connection = PluginConnection::handshake(host_read, host_write)
            .await
            .unwrap();
        assert_eq!(connection.negotiated_version(), 2);

        let groups = connection.get_builds().await.unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.total_builds(), 3);
    }

    #[tokio::test]
    async fn v1_plugin_downgrades_and_wraps_into_one_group() {
        let (host_read, plugin_write) = tokio::io::duplex(64 * 1024);
        let (plugin_read, host_write) = tokio::io::duplex(64 * 1024);

        tokio::spawn(fake_plugin(
            plugin_read,
            plugin_write,
            vec![1],
            MAGIC_COOKIE_VALUE,
            |version| {
                assert_eq!(version, 1);
                serde_json::to_value(BuildArgsResponse {
                    args: vec![build_args("a"), build_args("b")],
                })
                .unwrap()
            },
        ));

        let mut connection = PluginConnection::handshake(host_read, host_write)
            .await
            .unwrap();
        assert_eq!(connection.negotiated_version(), 1);

        let groups = connection.get_builds().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups.total_builds(), 2);
    }

    #[tokio::test]
    async fn cookie_mismatch_fails_the_handshake() {
        let (host_read, plugin_write) = tokio::io::duplex(64 * 1024);
        let (plugin_read, host_write) = tokio::io::duplex(64 * 1024);

        tokio::spawn(fake_plugin(
            plugin_read,
            plugin_write,
            vec![1, 2],
            "wrong",
            |_| serde_json::Value::Null,
        ));

        let err = PluginConnection::handshake(host_read, host_write)
            .await
            .unwrap_err();
        assert!(matches!(
            EngineError::from_err(&err),
            Some(EngineError::PluginHandshake(_))
        ));
    }

    #[tokio::test]
    async fn eof_surfaces_as_plugin_exit() {
        let (host_read, plugin_write) = tokio::io::duplex(64 * 1024);
        let (plugin_read, host_write) = tokio::io::duplex(64 * 1024);

        // handshake, then hang up
        tokio::spawn(async move {
            let mut reader = FramedRead::new(plugin_read, codec());
            let mut writer = FramedWrite::new(plugin_write, codec());
            if let Some(Ok(frame)) = reader.next().await {
                let request: Request = serde_json::from_slice(&frame).unwrap();
                let response = Response {
                    id: request.id,
                    result: Some(serde_json::to_value(Handshake::host()).unwrap()),
                    error: None,
                };
                let bytes = serde_json::to_vec(&response).unwrap();
                writer.send(bytes::Bytes::from(bytes)).await.unwrap();
            }
            // streams drop here
        });

        let mut connection = PluginConnection::handshake(host_read, host_write)
            .await
            .unwrap();
        let err = connection.get_builds().await.unwrap_err();
        assert!(matches!(
            EngineError::from_err(&err),
            Some(EngineError::PluginExit(_))
        ));
    }
}
