//! Inbound command handling.
//!
//! Commands live in a registry of matcher/handler pairs evaluated in
//! registration order: exact and prefix literals first, then an
//! address-shaped predicate so a bare `addr1…`/`stake1…` acts as input to
//! whatever flow is pending. Unmatched input gets a fixed reply; multiple
//! matches log a warning and the first wins. Multi-step flows keep an
//! explicit per-chat conversation state instead of ad hoc shared queues.
//! Every command runs through the dispatch pool under a soft timeout.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::chain::ChainApi;
use crate::dispatch::Dispatcher;
use crate::quota::{QuotaEngine, QuotaError};
use crate::store::{AddressKind, Subscription, SubscriptionStore};
use crate::telegram::{MessageSink, TelegramClient, Update};

const UNKNOWN_REPLY: &str = "Unknown command. Try /help.";
const HELP_TEXT: &str = "\
I watch Cardano addresses and tell you about new transactions, staking \
rewards, retiring pools and governance activity.

/subscribe - watch an address
/unsubscribe - stop watching an address
/list - addresses you watch
/help - this message";

/// Where a chat currently is in a multi-step flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    AwaitingAddress(PendingAction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Subscribe,
    Unsubscribe,
}

/// How inbound text is matched to a command.
pub enum Matcher {
    Exact(&'static str),
    Prefix(&'static str),
    Predicate(fn(&str) -> bool),
}

impl Matcher {
    fn matches(&self, text: &str) -> bool {
        match self {
            Matcher::Exact(literal) => text == *literal,
            Matcher::Prefix(prefix) => text.starts_with(prefix),
            Matcher::Predicate(check) => check(text),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CommandKind {
    Start,
    Help,
    Subscribe,
    Unsubscribe,
    List,
    Address,
}

pub struct CommandSpec {
    pub name: &'static str,
    pub matcher: Matcher,
    pub kind: CommandKind,
}

fn looks_like_address(text: &str) -> bool {
    (text.starts_with("addr1") || text.starts_with("stake1"))
        && text.len() > 10
        && text.chars().all(|c| c.is_ascii_alphanumeric())
}

fn address_kind(address: &str) -> Option<AddressKind> {
    if address.starts_with("stake1") {
        Some(AddressKind::Stake)
    } else if address.starts_with("addr1") {
        Some(AddressKind::Base)
    } else {
        None
    }
}

/// The built-in commands, in registration order.
pub fn command_registry() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "/start",
            matcher: Matcher::Exact("/start"),
            kind: CommandKind::Start,
        },
        CommandSpec {
            name: "/help",
            matcher: Matcher::Exact("/help"),
            kind: CommandKind::Help,
        },
        CommandSpec {
            name: "/subscribe",
            matcher: Matcher::Prefix("/subscribe"),
            kind: CommandKind::Subscribe,
        },
        CommandSpec {
            name: "/unsubscribe",
            matcher: Matcher::Prefix("/unsubscribe"),
            kind: CommandKind::Unsubscribe,
        },
        CommandSpec {
            name: "/list",
            matcher: Matcher::Exact("/list"),
            kind: CommandKind::List,
        },
        CommandSpec {
            name: "address",
            matcher: Matcher::Predicate(looks_like_address),
            kind: CommandKind::Address,
        },
    ]
}

/// First matching command wins; multiple matches are logged.
pub fn resolve<'a>(registry: &'a [CommandSpec], text: &str) -> Option<&'a CommandSpec> {
    let mut matches = registry.iter().filter(|c| c.matcher.matches(text));
    let first = matches.next()?;
    let extra = matches.count();
    if extra > 0 {
        warn!(
            input = text,
            command = first.name,
            also_matched = extra,
            "input matched multiple commands, first wins"
        );
    }
    Some(first)
}

pub struct Bot {
    chain: Arc<dyn ChainApi>,
    store: Arc<dyn SubscriptionStore>,
    quota: QuotaEngine,
    dispatcher: Dispatcher,
    sink: Arc<dyn MessageSink>,
    registry: Vec<CommandSpec>,
    sessions: DashMap<i64, ConversationState>,
    command_timeout: Duration,
}

impl Bot {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        store: Arc<dyn SubscriptionStore>,
        quota: QuotaEngine,
        dispatcher: Dispatcher,
        sink: Arc<dyn MessageSink>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            store,
            quota,
            dispatcher,
            sink,
            registry: command_registry(),
            sessions: DashMap::new(),
            command_timeout,
        }
    }

    /// Hand one inbound update to the dispatch pool. Never blocks the
    /// ingestion loop; a slow handler gets a timeout notice instead.
    pub fn handle_update(self: &Arc<Self>, update: Update) {
        let chat = update.chat_id;
        let text = update.payload.text().trim().to_string();
        let username = update.username.clone();
        let bot = self.clone();
        self.dispatcher
            .submit("command", self.command_timeout, Some(chat), async move {
                bot.run_command(chat, username.as_deref(), &text).await
            });
    }

    pub(crate) async fn run_command(
        &self,
        chat: i64,
        username: Option<&str>,
        text: &str,
    ) -> anyhow::Result<()> {
        let Some(spec) = resolve(&self.registry, text) else {
            return self.sink.send_message(chat, UNKNOWN_REPLY).await;
        };
        info!(
            chat = chat,
            username = username.unwrap_or("-"),
            command = spec.name,
            "command received"
        );

        match spec.kind {
            CommandKind::Start => {
                self.sink
                    .send_message(
                        chat,
                        "Hello! I watch Cardano addresses for you.\nSend /subscribe to start, or /help for everything I can do.",
                    )
                    .await
            }
            CommandKind::Help => self.sink.send_message(chat, HELP_TEXT).await,
            CommandKind::Subscribe => {
                self.sessions
                    .insert(chat, ConversationState::AwaitingAddress(PendingAction::Subscribe));
                self.sink
                    .send_message(chat, "Send the address (addr1… or stake1…) you want to watch.")
                    .await
            }
            CommandKind::Unsubscribe => {
                self.sessions.insert(
                    chat,
                    ConversationState::AwaitingAddress(PendingAction::Unsubscribe),
                );
                self.sink
                    .send_message(chat, "Send the address you want to stop watching.")
                    .await
            }
            CommandKind::List => self.list(chat).await,
            CommandKind::Address => self.handle_address(chat, text).await,
        }
    }

    async fn handle_address(&self, chat: i64, address: &str) -> anyhow::Result<()> {
        let state = self
            .sessions
            .get(&chat)
            .map(|s| *s)
            .unwrap_or(ConversationState::Idle);
        self.sessions.insert(chat, ConversationState::Idle);
        match state {
            ConversationState::AwaitingAddress(PendingAction::Unsubscribe) => {
                self.unsubscribe(chat, address).await
            }
            // A bare address acts as a subscribe request.
            _ => self.subscribe(chat, address).await,
        }
    }

    async fn subscribe(&self, chat: i64, address: &str) -> anyhow::Result<()> {
        let Some(kind) = address_kind(address) else {
            return self
                .sink
                .send_message(chat, "That doesn't look like a Cardano address.")
                .await;
        };

        match self.quota.verify(address, kind, chat).await {
            Ok(()) => {}
            // Business-rule refusals go to the subscriber verbatim.
            Err(e @ QuotaError::SlotsExceeded { .. })
            | Err(e @ QuotaError::AddressAlreadyOwned { .. }) => {
                return self.sink.send_message(chat, &e.to_string()).await;
            }
            Err(QuotaError::Upstream(e)) => {
                warn!(chat = chat, address = address, error = %e, "quota check hit upstream failure");
                return self
                    .sink
                    .send_message(chat, "Chain data is unavailable right now, please try again later.")
                    .await;
            }
            Err(QuotaError::Store(e)) => return Err(e.into()),
        }

        // Start from now: cursors begin at the chain tip so the first sync
        // pass only reports genuinely new activity.
        let tip = match self.chain.tip().await {
            Ok(tip) => tip,
            Err(e) => {
                warn!(chat = chat, error = %e, "tip lookup failed during subscribe");
                return self
                    .sink
                    .send_message(chat, "Chain data is unavailable right now, please try again later.")
                    .await;
            }
        };

        let mut sub = Subscription::new(chat, address.to_string(), kind);
        sub.last_block_height = tip.block_height + 1;
        sub.last_epoch_number = tip.epoch;
        let now = chrono::Utc::now().timestamp();
        sub.last_gov_votes_watermark = now;
        sub.last_gov_action_watermark = now;
        self.store.insert(&sub).await?;

        info!(chat = chat, address = address, kind = ?kind, "subscription added");
        self.sink
            .send_message(chat, &format!("Now watching <code>{}</code>.", address))
            .await
    }

    async fn unsubscribe(&self, chat: i64, address: &str) -> anyhow::Result<()> {
        let removed = self.store.remove(chat, address).await?;
        let reply = if removed {
            info!(chat = chat, address = address, "subscription removed");
            format!("Stopped watching <code>{}</code>.", address)
        } else {
            format!("You weren't watching <code>{}</code>.", address)
        };
        self.sink.send_message(chat, &reply).await
    }

    async fn list(&self, chat: i64) -> anyhow::Result<()> {
        let subs = self.store.for_subscriber(chat).await?;
        if subs.is_empty() {
            return self
                .sink
                .send_message(chat, "You're not watching any addresses yet. Send /subscribe to start.")
                .await;
        }
        let mut lines = vec![format!("Watching {} address(es):", subs.len())];
        for sub in subs {
            let kind = match sub.address_kind {
                AddressKind::Stake => "stake",
                AddressKind::Base => "base",
            };
            lines.push(format!("• <code>{}</code> ({})", sub.address, kind));
        }
        self.sink.send_message(chat, &lines.join("\n")).await
    }
}

/// Long-poll the platform for updates and feed them to the bot. Owns the
/// `update_id` offset cursor; poll failures back off and retry.
pub async fn run_update_loop(bot: Arc<Bot>, client: Arc<TelegramClient>) {
    let mut offset = 0i64;
    loop {
        match client.get_updates(offset).await {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    bot.handle_update(update);
                }
            }
            Err(e) => {
                warn!(error = %e, "update poll failed, backing off");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}
