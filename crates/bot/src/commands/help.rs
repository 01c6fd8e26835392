pub(super) fn text(prefix: &str) -> String {
    format!(
        "Stream alarm bot commands:\n\
         {prefix}live — streams live right now\n\
         {prefix}upcoming [hours] — upcoming streams (default 24h)\n\
         {prefix}schedule <member> — a member's next stream\n\
         {prefix}who <member> — member info\n\
         {prefix}alarm add <member> — notify me before their streams\n\
         {prefix}alarm remove <member> — stop notifying me\n\
         {prefix}alarm list — my alarms\n\
         {prefix}alarm clear — remove all my alarms\n\
         Korean keywords work too (라이브, 예정, 스케줄, 알람 …)."
    )
}

pub(super) fn hint(prefix: &str) -> String {
    format!("Try {prefix}help for the command list.")
}
