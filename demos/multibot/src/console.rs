//! A [`MessagingClient`] backed by the terminal.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleet::prelude::*;
use futures::StreamExt;
use futures::channel::mpsc;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};

const CONSOLE_USER: &str = "1";
const CONSOLE_CHAT: &str = "console";

type Feed = mpsc::UnboundedSender<Result<InboundEvent, ClientError>>;

#[derive(Default)]
pub struct ConsoleClient {
    feeds: Mutex<HashMap<String, Feed>>,
}

impl ConsoleClient {
    /// Reads `@<bot> <text>` lines from stdin until it closes.
    pub fn spawn_reader(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => this.deliver(&line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdin");
                        break;
                    }
                }
            }
        });
    }

    fn deliver(&self, line: &str) {
        let Some((bot_id, text)) = line.trim().strip_prefix('@').and_then(|l| l.split_once(' ')) else {
            println!("usage: @<bot> <text>");
            return;
        };
        let feeds = self.feeds.lock();
        match feeds.get(bot_id) {
            Some(feed) => {
                let event = InboundEvent::message(bot_id, CONSOLE_USER, CONSOLE_CHAT, text);
                let _ = feed.unbounded_send(Ok(event));
            }
            None => println!("no running bot named '{bot_id}'"),
        }
    }
}

#[async_trait]
impl MessagingClient for ConsoleClient {
    async fn start_consuming(
        &self,
        bot_id: &str,
        credentials: &Credentials,
        _mode: DeliveryMode,
    ) -> Result<EventStream, ClientError> {
        if credentials.is_empty() {
            return Err(ClientError::Connect {
                bot_id: bot_id.to_string(),
                reason: "empty token".into(),
            });
        }
        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().insert(bot_id.to_string(), tx);
        debug!(bot_id, "Console feed opened");
        Ok(rx.boxed())
    }

    async fn stop_consuming(&self, bot_id: &str) -> Result<(), ClientError> {
        self.feeds.lock().remove(bot_id);
        debug!(bot_id, "Console feed closed");
        Ok(())
    }

    async fn send(&self, bot_id: &str, payload: OutboundPayload) -> Result<(), ClientError> {
        println!("[{bot_id}] {}", payload.text);
        Ok(())
    }
}
