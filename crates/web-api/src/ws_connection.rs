use std::sync::{Arc, Mutex, PoisonError};

use application::{ConnectionHandle, HubConfig};
use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

type Sender = SplitSink<WebSocket, WsMessage>;

/// WebSocket 连接
///
/// 推送中心已经完成注册，这里只负责把出站队列写到 socket。
/// 每个方向各占一个任务：
/// - 发送任务：出站消息、心跳 ping、关闭帧
/// - 接收任务：记录客户端活跃时间，回应 ping，收到关闭帧后结束
///
/// 超过 `pong_timeout` 没有收到客户端任何帧时断开连接。
pub struct WebSocketConnection {
    socket: WebSocket,
    handle: ConnectionHandle,
    config: HubConfig,
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendPong(Vec<u8>),
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, handle: ConnectionHandle, config: HubConfig) -> Self {
        tracing::info!(
            connection_id = %handle.id(),
            user_id = %handle.user_id(),
            rooms = handle.rooms().len(),
            "WebSocket 连接已建立"
        );
        Self {
            socket,
            handle,
            config,
        }
    }

    pub async fn run(self) {
        let Self {
            socket,
            handle,
            config,
        } = self;
        let connection_id = handle.id();
        let handle = Arc::new(handle);
        let (mut sender, mut incoming) = socket.split();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);
        let last_seen = Arc::new(Mutex::new(Instant::now()));

        // 发送任务：出站消息、pong、心跳和关闭帧都经由这里写出
        let mut send_task = {
            let last_seen = Arc::clone(&last_seen);
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let closed = handle.shutdown_signal();
                let mut heartbeat = interval(config.ping_interval);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                heartbeat.tick().await;

                loop {
                    tokio::select! {
                        biased;
                        _ = closed.cancelled() => {
                            send_close(&mut sender, "connection closed by server").await;
                            break;
                        }
                        Some(WsCommand::SendPong(data)) = cmd_rx.recv() => {
                            if sender.send(WsMessage::Pong(data.into())).await.is_err() {
                                tracing::warn!(connection_id = %connection_id, "发送 pong 失败");
                                break;
                            }
                        }
                        message = handle.next_message() => {
                            let Some(bytes) = message else {
                                send_close(&mut sender, "connection closed by server").await;
                                break;
                            };
                            if sender.send(frame(bytes)).await.is_err() {
                                tracing::warn!(connection_id = %connection_id, "发送消息失败");
                                break;
                            }
                        }
                        _ = heartbeat.tick() => {
                            let idle = last_seen.lock().unwrap_or_else(PoisonError::into_inner).elapsed();
                            if idle > config.pong_timeout {
                                tracing::warn!(
                                    connection_id = %connection_id,
                                    idle_secs = idle.as_secs(),
                                    "客户端心跳超时"
                                );
                                send_close(&mut sender, "heartbeat timeout").await;
                                break;
                            }
                            if sender.send(WsMessage::Ping(Default::default())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                tracing::debug!(connection_id = %connection_id, "WebSocket 发送任务结束");
            })
        };

        // 接收任务：记录活跃时间，把 ping 转成 pong 命令
        let mut recv_task = tokio::spawn(async move {
            while let Some(Ok(message)) = incoming.next().await {
                *last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
                match message {
                    WsMessage::Close(_) => {
                        tracing::debug!(connection_id = %connection_id, "收到关闭帧");
                        break;
                    }
                    WsMessage::Ping(data) => {
                        if cmd_tx.send(WsCommand::SendPong(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Text(_) | WsMessage::Binary(_) => {
                        tracing::debug!(connection_id = %connection_id, "忽略客户端消息");
                    }
                }
            }
            tracing::debug!(connection_id = %connection_id, "WebSocket 接收任务结束");
        });

        // 任意一方结束即断开，另一方被中止并等待其退出
        let send_finished = tokio::select! {
            _ = &mut send_task => true,
            _ = &mut recv_task => false,
        };
        let remaining = if send_finished { recv_task } else { send_task };
        remaining.abort();
        let _ = remaining.await;

        handle.close();
        tracing::info!(connection_id = %connection_id, "WebSocket 连接已断开");
    }
}

fn frame(bytes: Vec<u8>) -> WsMessage {
    match String::from_utf8(bytes) {
        Ok(text) => WsMessage::Text(text.into()),
        Err(err) => WsMessage::Binary(err.into_bytes().into()),
    }
}

async fn send_close(sender: &mut Sender, reason: &'static str) {
    let close = WsMessage::Close(Some(CloseFrame {
        code: close_code::AWAY,
        reason: Utf8Bytes::from_static(reason),
    }));
    if sender.send(close).await.is_err() {
        tracing::debug!("关闭帧发送失败，连接可能已断开");
    }
}
