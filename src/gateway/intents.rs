//! Gateway intent bits.
//!
//! A session's IDENTIFY carries an intents mask. An event tagged with a
//! required intent reaches only sessions whose mask shares a bit with it;
//! untagged events reach everyone.

pub const GUILDS: u64 = 1 << 0;
pub const GUILD_MEMBERS: u64 = 1 << 1;
pub const GUILD_MODERATION: u64 = 1 << 2;
pub const GUILD_EMOJIS: u64 = 1 << 3;
pub const GUILD_INTEGRATIONS: u64 = 1 << 4;
pub const GUILD_WEBHOOKS: u64 = 1 << 5;
pub const GUILD_INVITES: u64 = 1 << 6;
pub const GUILD_VOICE_STATES: u64 = 1 << 7;
/// Privileged.
pub const GUILD_PRESENCES: u64 = 1 << 8;
pub const GUILD_MESSAGES: u64 = 1 << 9;
pub const GUILD_MESSAGE_REACTIONS: u64 = 1 << 10;
pub const GUILD_MESSAGE_TYPING: u64 = 1 << 11;
pub const DIRECT_MESSAGES: u64 = 1 << 12;
pub const DIRECT_MESSAGE_REACTIONS: u64 = 1 << 13;
pub const DIRECT_MESSAGE_TYPING: u64 = 1 << 14;
/// Privileged.
pub const MESSAGE_CONTENT: u64 = 1 << 15;
pub const GUILD_SCHEDULED_EVENTS: u64 = 1 << 16;
pub const AUTO_MODERATION_CONFIGURATION: u64 = 1 << 20;
pub const AUTO_MODERATION_EXECUTION: u64 = 1 << 21;

const NAMES: [(u64, &str); 19] = [
    (GUILDS, "GUILDS"),
    (GUILD_MEMBERS, "GUILD_MEMBERS"),
    (GUILD_MODERATION, "GUILD_MODERATION"),
    (GUILD_EMOJIS, "GUILD_EMOJIS"),
    (GUILD_INTEGRATIONS, "GUILD_INTEGRATIONS"),
    (GUILD_WEBHOOKS, "GUILD_WEBHOOKS"),
    (GUILD_INVITES, "GUILD_INVITES"),
    (GUILD_VOICE_STATES, "GUILD_VOICE_STATES"),
    (GUILD_PRESENCES, "GUILD_PRESENCES"),
    (GUILD_MESSAGES, "GUILD_MESSAGES"),
    (GUILD_MESSAGE_REACTIONS, "GUILD_MESSAGE_REACTIONS"),
    (GUILD_MESSAGE_TYPING, "GUILD_MESSAGE_TYPING"),
    (DIRECT_MESSAGES, "DIRECT_MESSAGES"),
    (DIRECT_MESSAGE_REACTIONS, "DIRECT_MESSAGE_REACTIONS"),
    (DIRECT_MESSAGE_TYPING, "DIRECT_MESSAGE_TYPING"),
    (MESSAGE_CONTENT, "MESSAGE_CONTENT"),
    (GUILD_SCHEDULED_EVENTS, "GUILD_SCHEDULED_EVENTS"),
    (AUTO_MODERATION_CONFIGURATION, "AUTO_MODERATION_CONFIGURATION"),
    (AUTO_MODERATION_EXECUTION, "AUTO_MODERATION_EXECUTION"),
];

/// Whether a session with `mask` should receive an event requiring `required`.
#[inline]
pub fn allows(mask: u64, required: Option<u64>) -> bool {
    required.is_none_or(|bits| mask & bits != 0)
}

/// Names of the known bits set in `mask`, in bit order. Unknown bits are skipped.
pub fn describe(mask: u64) -> String {
    let names: Vec<&str> = NAMES
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    format!("[{}]", names.join(", "))
}
