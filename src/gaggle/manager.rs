//! Manager-specific code: accept worker connections and relay supervisor events.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::gaggle::common::{decode_message, send_json, Event, Hello, SubmitResponse};
use crate::gaggle::supervisor::Supervisor;
use crate::util::CancelHandle;
use crate::SkeinError;

/// Simplify the type of the outbound half of a worker connection.
type WorkerSender = futures::stream::SplitSink<tokio_tungstenite::WebSocketStream<TcpStream>, Message>;
/// Simplify the type of the inbound half of a worker connection.
type WorkerReceiver = futures::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>;

/// Bind the manager's listening socket.
pub(crate) async fn bind_manager(address: &str) -> Result<(TcpListener, SocketAddr), SkeinError> {
    debug!("preparing to bind manager to: {}", address);
    let listener = TcpListener::bind(address).await?;
    let local_address = listener.local_addr()?;
    info!("manager listening on: {}", local_address);
    Ok((listener, local_address))
}

/// Accept worker connections until `shutdown` is cancelled. Each connection is served
/// by its own task.
pub(crate) async fn manager_main(listener: TcpListener, supervisor: Arc<Supervisor>, shutdown: CancelHandle) {
    // Counter increments each time a worker connects, used for debug logging.
    let mut connection_id: u32 = 0;

    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("failed to accept worker connection: {}", e);
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        connection_id += 1;

        let peer_address = stream
            .peer_addr()
            .map_or("UNKNOWN ADDRESS".to_string(), |p| p.to_string());
        // The task runs until the worker leaves or the manager shuts down, so its
        // JoinHandle is ignored.
        let _ignored_joinhandle = tokio::spawn(accept_connection(
            Arc::clone(&supervisor),
            stream,
            connection_id,
            peer_address,
        ));
    }
    info!("manager stopped accepting workers");
}

async fn accept_connection(supervisor: Arc<Supervisor>, stream: TcpStream, connection_id: u32, peer_address: String) {
    let stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(s) => s,
        Err(e) => {
            info!("invalid WebSocket handshake from {}: {}", peer_address, e);
            return;
        }
    };
    debug!("connection [{}] opened from {}", connection_id, peer_address);
    let (mut ws_sender, mut ws_receiver) = stream.split();

    let hello = loop {
        let message = match ws_receiver.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                info!("connection [{}] from {} failed: {}", connection_id, peer_address, e);
                return;
            }
            None => return,
        };
        match decode_message::<Hello>(&message) {
            Ok(Some(hello)) => break hello,
            Ok(None) => continue,
            Err(e) => {
                warn!("connection [{}] from {} sent an invalid hello: {}", connection_id, peer_address, e);
                let _ = ws_sender.close().await;
                return;
            }
        }
    };

    match hello {
        Hello::Submit(request) => {
            let result = supervisor.submit(request).await;
            if let Err(e) = send_json(&mut ws_sender, &SubmitResponse { result }).await {
                info!("failed to answer submission from {}: {}", peer_address, e);
            }
            let _ = ws_sender.close().await;
        }
        Hello::Subscribe { worker_id, extras } => {
            let (agent, events) = match supervisor.subscribe(&worker_id, extras).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    error!("cannot subscribe worker from {}: {}", peer_address, e);
                    let _ = ws_sender.close().await;
                    return;
                }
            };
            relay_events(&worker_id, events, &mut ws_sender, &mut ws_receiver).await;
            // The queue is gone, so unsubscribing doesn't wait to queue a disconnect.
            supervisor.unsubscribe(agent.id()).await;
            let _ = ws_sender.close().await;
        }
    }
}

// Forward queued events to the worker until a disconnect is sent or the worker leaves.
async fn relay_events(
    worker_id: &str,
    events: flume::Receiver<Event>,
    ws_sender: &mut WorkerSender,
    ws_receiver: &mut WorkerReceiver,
) {
    loop {
        tokio::select! {
            event = events.recv_async() => {
                let event = match event {
                    Ok(event) => event,
                    Err(_) => break,
                };
                let disconnect = event == Event::Disconnect;
                if let Err(e) = send_json(ws_sender, &event).await {
                    error!("failed to send {} to worker {}: {}", event, worker_id, e);
                    break;
                }
                if disconnect {
                    warn!("manager is disconnecting worker {}", worker_id);
                    break;
                }
            }
            message = ws_receiver.next() => match message {
                Some(Ok(message)) if !message.is_close() => {
                    trace!("ignoring {:?} from subscribed worker {}", message, worker_id);
                }
                _ => {
                    info!("worker {} disconnected", worker_id);
                    break;
                }
            },
        }
    }
}
