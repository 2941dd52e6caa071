use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use tracing::{debug, error, info, warn};

use crate::api::{state::AppState, types::StreamQuery};
use crate::domain::StreamEvent;
use crate::market_data::StreamSubscription;

/// Upper bound on symbols per stream connection
pub const MAX_STREAM_SYMBOLS: usize = 100;

/// Split `A, b,A` into `["A", "B"]`, keeping first-seen order
pub fn parse_symbols(raw: &str) -> std::result::Result<Vec<String>, String> {
    let mut symbols: Vec<String> = Vec::new();
    for part in raw.split(',') {
        let symbol = part.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            continue;
        }
        if !symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(format!("invalid symbol '{}'", symbol));
        }
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }

    if symbols.is_empty() {
        return Err("symbols parameter is required".to_string());
    }
    if symbols.len() > MAX_STREAM_SYMBOLS {
        return Err(format!(
            "at most {} symbols per stream, got {}",
            MAX_STREAM_SYMBOLS,
            symbols.len()
        ));
    }
    Ok(symbols)
}

/// GET /stream?symbols=AAPL,MSFT
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, (StatusCode, String)> {
    let symbols = parse_symbols(&query.symbols).map_err(|e| {
        warn!(error = %e, "Stream connection rejected");
        (StatusCode::BAD_REQUEST, e)
    })?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, symbols)))
}

async fn handle_socket(socket: WebSocket, state: AppState, symbols: Vec<String>) {
    let (mut sender, mut receiver) = socket.split();

    // Registered before the snapshot so nothing published in between is lost
    let mut subscription: StreamSubscription = state.ctx.fanout.subscribe_many(&symbols);
    let consumer = subscription.consumer();

    for symbol in &symbols {
        let Some((quote, _stale)) = state.ctx.quotes.peek(symbol) else {
            continue;
        };
        if send_event(&mut sender, &StreamEvent::Quote(quote)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    info!(consumer, "Stream queue closed, disconnecting consumer");
                    break;
                };
                if send_event(&mut sender, &event).await.is_err() {
                    debug!(consumer, "Stream client went away");
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Axum answers pings itself; client text is ignored
                    }
                    Some(Err(e)) => {
                        debug!(consumer, error = %e, "Stream read error");
                        break;
                    }
                }
            }
        }
    }

    let _ = sender.close().await;
    drop(subscription);
    info!(consumer, "Stream connection closed");
}

async fn send_event<S>(sender: &mut S, event: &StreamEvent) -> std::result::Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize stream event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json)).await.map_err(|_| ())
}
