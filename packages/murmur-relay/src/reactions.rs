//! Reaction edit rules.
//!
//! A user has at most one reaction per message. Reacting with the same emoji
//! again removes it; a different emoji replaces it in place.

use murmur_core::protocol::Reaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOutcome {
    Added,
    Replaced,
    Removed,
}

pub fn apply(reactions: &mut Vec<Reaction>, user_id: &str, emoji: &str) -> ReactionOutcome {
    match reactions.iter().position(|r| r.user_id == user_id) {
        Some(index) if reactions[index].emoji == emoji => {
            reactions.remove(index);
            ReactionOutcome::Removed
        }
        Some(index) => {
            reactions[index].emoji = emoji.to_string();
            ReactionOutcome::Replaced
        }
        None => {
            reactions.push(Reaction {
                user_id: user_id.to_string(),
                emoji: emoji.to_string(),
            });
            ReactionOutcome::Added
        }
    }
}
