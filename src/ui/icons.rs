//! Shared status icons, with plain-text fallbacks for terminals without emoji.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static PAUSED: Emoji<'_, '_> = Emoji("⏸️  ", "[WAIT]");
pub static STOPPED: Emoji<'_, '_> = Emoji("🛑 ", "[STOP]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
pub static SHIELD: Emoji<'_, '_> = Emoji("🛡️  ", "[!]");
pub static REPORT: Emoji<'_, '_> = Emoji("📄 ", "[R]");
