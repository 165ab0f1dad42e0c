use const_format::formatcp;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");
pub const BUILD_DATE: &str = env!("VERGEN_BUILD_DATE");

/// 埋め込みのフッターに表示する文字列。
pub const FOOTER: &str = formatcp!("Birthdayy v{VERSION}");

/// clap の `--version` 用のバージョン文字列を返す。
pub fn short_version() -> &'static str {
    formatcp!("{VERSION} ({GIT_SHA} {BUILD_DATE})")
}
