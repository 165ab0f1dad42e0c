use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use birthdayy_core::MessageTemplate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub discord: DiscordConfig,
    #[serde(default)]
    pub reminder: ReminderConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub guilds: Vec<GuildConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DiscordConfig {
    pub token: String,
    /// 他ユーザーの誕生日を権限に関係なく管理できるユーザー ID
    #[serde(default)]
    pub admins: Vec<u64>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: "YOUR_DISCORD_BOT_TOKEN".to_string(),
            admins: vec![],
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReminderConfig {
    /// 期限を迎えたリマインダーを確認する間隔
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,
    /// ギルドごとの設定がない場合に使うタイムゾーン
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    /// ギルドごとの設定がない場合に使うお祝いメッセージ
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub message: MessageTemplate,
}

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_timezone() -> Tz {
    Tz::UTC
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            timezone: default_timezone(),
            message: MessageTemplate::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("birthdays.json")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GuildConfig {
    pub id: u64,
    /// お祝いメッセージを投稿するチャンネル
    pub channel_id: u64,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<Tz>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageTemplate>,
    /// お祝いメッセージでメンションするロール
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<u64>,
}

impl Default for GuildConfig {
    fn default() -> Self {
        Self {
            id: 0,
            channel_id: 0,
            timezone: Some(Tz::Asia__Tokyo),
            message: Some(MessageTemplate::parse(
                "🎂 Happy birthday, {user}!{line}Have a great {age.ordinal} birthday!",
            )),
            role_id: None,
        }
    }
}

impl Config {
    pub fn find_guild(&self, id: u64) -> Option<&GuildConfig> {
        self.guilds.iter().find(|g| g.id == id)
    }

    /// ギルドのタイムゾーンを返す。未設定ならデフォルトを使う。
    pub fn timezone_for(&self, guild_id: u64) -> Tz {
        self.find_guild(guild_id)
            .and_then(|g| g.timezone)
            .unwrap_or(self.reminder.timezone)
    }

    /// ギルドのお祝いメッセージを返す。未設定ならデフォルトを使う。
    pub fn message_for(&self, guild_id: u64) -> &MessageTemplate {
        self.find_guild(guild_id)
            .and_then(|g| g.message.as_ref())
            .unwrap_or(&self.reminder.message)
    }
}

pub fn open_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path.as_ref()).context("Failed to read configuration file")?;
    let config: Config = toml::from_str(&content).context("Failed to parse configuration file")?;
    Ok(config)
}

pub fn write_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
    let config = Config {
        guilds: vec![GuildConfig::default()],
        ..Default::default()
    };
    let content = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
    fs::write(path.as_ref(), content).context("Failed to write configuration file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_example_config() {
        let content = include_str!("../../../config.example.toml");
        let config: Config = toml::from_str(content).expect("Failed to parse config.example.toml");

        let expected = Config {
            discord: DiscordConfig {
                token: "YOUR_DISCORD_BOT_TOKEN".to_string(),
                admins: vec![123456789012345678],
            },
            reminder: ReminderConfig {
                interval: Duration::from_secs(30),
                timezone: Tz::Europe__Berlin,
                message: MessageTemplate::parse("🎂 Happy birthday, {user}!"),
            },
            store: StoreConfig {
                path: PathBuf::from("data/birthdays.json"),
            },
            guilds: vec![
                GuildConfig {
                    id: 111111111111111111,
                    channel_id: 222222222222222222,
                    timezone: Some(Tz::Asia__Tokyo),
                    message: Some(MessageTemplate::parse(
                        "{user} が {age} 歳になりました！{line}おめでとう 🎉",
                    )),
                    role_id: Some(333333333333333333),
                },
                GuildConfig {
                    id: 444444444444444444,
                    channel_id: 555555555555555555,
                    timezone: None,
                    message: None,
                    role_id: None,
                },
            ],
        };

        assert_eq!(config, expected);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let content = r#"
            [discord]
            token = "token"
        "#;
        let config: Config = toml::from_str(content).unwrap();

        assert_eq!(config.reminder, ReminderConfig::default());
        assert_eq!(config.store.path, PathBuf::from("birthdays.json"));
        assert!(config.guilds.is_empty());
        assert_eq!(config.timezone_for(1), Tz::UTC);
        assert_eq!(config.message_for(1), &MessageTemplate::default());
    }

    #[test]
    fn guild_overrides() {
        let content = include_str!("../../../config.example.toml");
        let config: Config = toml::from_str(content).unwrap();

        assert_eq!(config.timezone_for(111111111111111111), Tz::Asia__Tokyo);
        assert_eq!(config.timezone_for(444444444444444444), Tz::Europe__Berlin);
        assert_eq!(
            config.message_for(444444444444444444),
            &config.reminder.message
        );
        assert!(config.find_guild(999).is_none());
    }

    #[test]
    fn invalid_timezone_is_rejected() {
        let content = r#"
            [discord]
            token = "token"

            [reminder]
            timezone = "Mars/Olympus_Mons"
        "#;
        assert!(toml::from_str::<Config>(content).is_err());
    }

    #[test]
    fn default_config_round_trips() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        write_default_config(temp.path()).unwrap();

        let config = open_config(temp.path()).unwrap();
        assert_eq!(config.guilds, vec![GuildConfig::default()]);
        assert_eq!(config.reminder, ReminderConfig::default());
    }
}
