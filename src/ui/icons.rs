//! Shared UI icons.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static WAVE: Emoji<'_, '_> = Emoji("🌊 ", "[W]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static VERIFY: Emoji<'_, '_> = Emoji("🔍 ", "[V]");
pub static ESCALATE: Emoji<'_, '_> = Emoji("🚧 ", "[ESC]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
