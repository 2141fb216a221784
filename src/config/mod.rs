//! Static configuration: oracle prompts and app packages.

mod apps;
mod prompts;

pub use apps::{is_known_app, resolve_package, APP_PACKAGES};
pub use prompts::{get_system_prompt, SYSTEM_PROMPT_EN, SYSTEM_PROMPT_ZH};
