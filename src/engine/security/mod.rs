// Clawdbot Gateway — Security & Policy Layer
//
// Every tool call and every external input passes through here:
//   audit.rs      — append-only JSONL audit trail
//   dangerous.rs  — shell-command risk detector
//   rate_limit.rs — windowed per-key rate limiting
//   fs_guard.rs   — sensitive-path access monitor
//   secrets.rs    — secret scanning + 0600 persistence
//   injection.rs  — prompt-injection scanner for inbound channel text
//   otp.rs        — TOTP verification policy

pub mod audit;
pub mod dangerous;
pub mod fs_guard;
pub mod injection;
pub mod otp;
pub mod rate_limit;
pub mod secrets;
