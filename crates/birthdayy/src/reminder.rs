//! 誕生日のお祝いメッセージを定期的に送信する。
//!
//! 各レコードは次に送信すべき日時を持っており、定期的に期限を迎えたものを
//! 送信して翌年の日時に更新する。日時はギルドのタイムゾーンの 0 時に合わせる。

use std::sync::Arc;

use anyhow::{Context as _, Result};
use birthdayy_core::{
    CalendarDate, DateError, MessageContext, MessageTemplate, NextOccurrenceOptions, compute_age,
    next_occurrence,
};
use chrono::{DateTime, Offset, TimeDelta, Utc};
use chrono_tz::Tz;
use serenity::all::{ChannelId, CreateMessage, Http, Mentionable, RoleId, UserId};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::store::{BirthdayRecord, BirthdayStore, SharedStore};

/// `instant` におけるタイムゾーンの UTC からのずれ (東が正)。
fn utc_offset(instant: DateTime<Utc>, tz: Tz) -> TimeDelta {
    let seconds = instant.with_timezone(&tz).offset().fix().local_minus_utc();
    TimeDelta::seconds(i64::from(seconds))
}

/// `now` の現地時刻を、そのまま UTC として扱った日時を返す。
///
/// 日付の比較はこの値に対して行うことで、現地の日付で判定される。
pub fn local_reference(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    now.with_timezone(&tz).naive_local().and_utc()
}

/// 現地時刻で次に誕生日の 0 時を迎える日時を計算する。
///
/// # Arguments
/// * `date` - 誕生日
/// * `now` - 基準となる現在時刻
/// * `tz` - ギルドのタイムゾーン
/// * `repeat_if_today` - 今日が誕生日の場合に翌年の日時を返すかどうか
pub fn schedule(
    date: CalendarDate,
    now: DateTime<Utc>,
    tz: Tz,
    repeat_if_today: bool,
) -> birthdayy_core::Result<DateTime<Utc>> {
    let reference = local_reference(now, tz);
    let day = i32::from(date.day());
    let mut options = NextOccurrenceOptions {
        repeat_if_today,
        timezone_offset: -utc_offset(now, tz),
    };
    let candidate = next_occurrence(date.month(), day, reference, options)?;

    // 夏時間をまたぐ場合は当日のオフセットで計算し直す
    let offset = -utc_offset(candidate, tz);
    if offset == options.timezone_offset {
        return Ok(candidate);
    }
    options.timezone_offset = offset;
    next_occurrence(date.month(), day, reference, options)
}

/// 登録したときの次のリマインダー日時。
///
/// 今日が誕生日でも、今日すでにお祝い済みであれば翌年の日時を返す。
pub fn schedule_new(
    date: CalendarDate,
    now: DateTime<Utc>,
    tz: Tz,
    last_announced: Option<DateTime<Utc>>,
) -> birthdayy_core::Result<DateTime<Utc>> {
    let next = schedule(date, now, tz, false)?;
    if next <= now && last_announced.is_some_and(|at| at >= next) {
        return schedule(date, now, tz, true);
    }
    Ok(next)
}

/// 誕生日を変更したときの次のリマインダー日時。月日が変わらなければ元の日時を保つ。
pub fn schedule_update(
    existing: &BirthdayRecord,
    date: CalendarDate,
    now: DateTime<Utc>,
    tz: Tz,
    last_announced: Option<DateTime<Utc>>,
) -> birthdayy_core::Result<DateTime<Utc>> {
    if existing.date.month() == date.month() && existing.date.day() == date.day() {
        return Ok(existing.next_reminder);
    }
    schedule_new(date, now, tz, last_announced)
}

/// お祝いメッセージの送り先。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// 設定されたチャンネルに送信する
    Send {
        channel_id: u64,
        role_id: Option<u64>,
    },
    /// ギルドの設定がないため送信しない
    Unconfigured,
    /// 期限から 1 日以上経過しているため送信しない
    Stale,
}

/// 期限を迎えたリマインダーの処理内容。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueReminder {
    pub guild_id: u64,
    pub user_id: u64,
    pub age: Option<i32>,
    pub delivery: Delivery,
    /// 処理対象になったときのリマインダー日時
    pub fired: DateTime<Utc>,
    /// 次回のリマインダー日時
    pub next_reminder: DateTime<Utc>,
}

/// 期限を迎えたレコードごとに、送信先と次回の日時を決める。
pub fn plan(config: &Config, records: &[BirthdayRecord], now: DateTime<Utc>) -> Vec<DueReminder> {
    records
        .iter()
        .filter_map(|record| match plan_one(config, record, now) {
            Ok(reminder) => Some(reminder),
            Err(e) => {
                error!(
                    guild_id = record.guild_id,
                    user_id = record.user_id,
                    error = %e,
                    "Failed to schedule next reminder"
                );
                None
            }
        })
        .collect()
}

fn plan_one(
    config: &Config,
    record: &BirthdayRecord,
    now: DateTime<Utc>,
) -> birthdayy_core::Result<DueReminder> {
    let tz = config.timezone_for(record.guild_id);
    let fired = record.next_reminder;
    let day_after = fired
        .checked_add_signed(TimeDelta::days(1))
        .ok_or(DateError::OutOfRange)?;
    let next_reminder = schedule(record.date, day_after.max(now), tz, true)?;

    let delivery = match config.find_guild(record.guild_id) {
        None => Delivery::Unconfigured,
        Some(_) if now > day_after => Delivery::Stale,
        Some(guild) => Delivery::Send {
            channel_id: guild.channel_id,
            role_id: guild.role_id,
        },
    };

    Ok(DueReminder {
        guild_id: record.guild_id,
        user_id: record.user_id,
        age: compute_age(record.date, local_reference(now, tz)),
        delivery,
        fired,
        next_reminder,
    })
}

/// お祝いメッセージをチャンネルに送信する。
pub async fn announce(
    http: &Http,
    channel_id: u64,
    role_id: Option<u64>,
    template: &MessageTemplate,
    user_id: u64,
    age: Option<i32>,
) -> Result<()> {
    let user = UserId::new(user_id)
        .to_user(http)
        .await
        .context("Failed to fetch user")?;

    let mention = user.mention().to_string();
    let tag = user.tag();
    let context = MessageContext {
        mention: &mention,
        name: &user.name,
        tag: &tag,
        age,
    };

    let mut content = template.render(&context);
    if let Some(role_id) = role_id {
        content = format!("{} {}", RoleId::new(role_id).mention(), content);
    }

    ChannelId::new(channel_id)
        .send_message(http, CreateMessage::new().content(content))
        .await
        .context("Failed to send birthday message")?;

    Ok(())
}

/// リマインダーの処理結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    /// 送信せずに次回へ回した
    Skipped,
    Failed,
}

/// 処理結果をストアに反映する。再スケジュールした場合は true を返す。
///
/// 送信に失敗したレコードはそのまま残し、次の確認で再送する。
pub fn complete(
    store: &mut BirthdayStore,
    reminder: &DueReminder,
    outcome: Outcome,
    now: DateTime<Utc>,
) -> Result<bool> {
    let (guild_id, user_id) = (reminder.guild_id, reminder.user_id);
    match outcome {
        Outcome::Failed => return Ok(false),
        Outcome::Sent => store.mark_announced(guild_id, user_id, now)?,
        Outcome::Skipped => {}
    }

    // 処理中に更新されたレコードは上書きしない
    if store.get(guild_id, user_id).map(|r| r.next_reminder) != Some(reminder.fired) {
        return Ok(false);
    }
    store.reschedule(guild_id, user_id, reminder.next_reminder)
}

/// 期限を迎えたリマインダーを処理する。
async fn tick(http: &Http, config: &Config, store: &SharedStore, now: DateTime<Utc>) -> Result<()> {
    let due = store.lock().await.due(now);
    if due.is_empty() {
        return Ok(());
    }

    for reminder in plan(config, &due, now) {
        let (guild_id, user_id) = (reminder.guild_id, reminder.user_id);

        let outcome = match reminder.delivery {
            Delivery::Send {
                channel_id,
                role_id,
            } => {
                let template = config.message_for(guild_id);
                match announce(http, channel_id, role_id, template, user_id, reminder.age).await {
                    Ok(()) => {
                        info!(guild_id, user_id, "Birthday message sent");
                        Outcome::Sent
                    }
                    Err(e) => {
                        error!(guild_id, user_id, error = %e, "Failed to send birthday message");
                        Outcome::Failed
                    }
                }
            }
            Delivery::Unconfigured => {
                warn!(guild_id, user_id, "Guild is not configured, skipping birthday message");
                Outcome::Skipped
            }
            Delivery::Stale => {
                warn!(guild_id, user_id, fired = %reminder.fired, "Reminder is overdue, skipping birthday message");
                Outcome::Skipped
            }
        };

        complete(&mut *store.lock().await, &reminder, outcome, now)?;
    }

    Ok(())
}

/// リマインダーを定期的に確認するループを実行する。
pub async fn run_reminder_loop(http: Arc<Http>, config: Arc<Config>, store: SharedStore) {
    let interval = config.reminder.interval;

    info!(
        interval = %humantime::format_duration(interval),
        "Starting birthday reminder"
    );

    loop {
        if let Err(e) = tick(&http, &config, &store, Utc::now()).await {
            error!(error = %e, "Birthday reminder failed");
        }
        tokio::time::sleep(interval).await;
    }
}
