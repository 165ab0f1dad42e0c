//! ギルドメンバーの誕生日を永続化するストア。

use std::{
    cmp::Ordering,
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context as _, Result};
use birthdayy_core::{CalendarDate, compare_to_today};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// コマンドハンドラーとリマインダーで共有するストア。
pub type SharedStore = Arc<Mutex<BirthdayStore>>;

/// 登録された誕生日。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BirthdayRecord {
    /// Discord ギルド ID
    pub guild_id: u64,
    /// Discord ユーザー ID
    pub user_id: u64,
    /// 誕生日
    pub date: CalendarDate,
    /// 次にお祝いメッセージを送る日時
    pub next_reminder: DateTime<Utc>,
    /// 登録日時
    pub created_at: DateTime<Utc>,
}

impl BirthdayRecord {
    fn key(&self) -> (u64, u64) {
        (self.guild_id, self.user_id)
    }
}

/// お祝いメッセージを最後に送信した日時。
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Announcement {
    guild_id: u64,
    user_id: u64,
    at: DateTime<Utc>,
}

/// 保存ファイルの形式。
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    birthdays: Vec<BirthdayRecord>,
    #[serde(default)]
    announced: Vec<Announcement>,
}

/// 誕生日を (ギルド, ユーザー) ごとに 1 件ずつ管理するストア。
pub struct BirthdayStore {
    /// 永続化ファイルのパス
    path: PathBuf,
    /// (ギルドID, ユーザーID) -> レコード のマッピング
    records: HashMap<(u64, u64), BirthdayRecord>,
    /// (ギルドID, ユーザーID) -> 最後に送信した日時。レコードを削除しても残す
    announced: HashMap<(u64, u64), DateTime<Utc>>,
}

impl BirthdayStore {
    /// ストアを読み込む。ファイルが存在しない場合は空のストアを作成する。
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if path.exists() {
            let content = fs::read_to_string(&path).context("Failed to read birthday store")?;
            serde_json::from_str(&content).context("Failed to parse birthday store")?
        } else {
            StoreFile::default()
        };
        Ok(Self {
            path,
            records: file.birthdays.into_iter().map(|r| (r.key(), r)).collect(),
            announced: file
                .announced
                .into_iter()
                .map(|a| ((a.guild_id, a.user_id), a.at))
                .collect(),
        })
    }

    /// ストアをファイルに保存する。
    pub fn save(&self) -> Result<()> {
        let mut birthdays: Vec<BirthdayRecord> = self.records.values().cloned().collect();
        birthdays.sort_by_key(|r| r.key());
        let mut announced: Vec<Announcement> = self
            .announced
            .iter()
            .map(|(&(guild_id, user_id), &at)| Announcement {
                guild_id,
                user_id,
                at,
            })
            .collect();
        announced.sort_by_key(|a| (a.guild_id, a.user_id));

        let content = serde_json::to_string_pretty(&StoreFile {
            birthdays,
            announced,
        })
        .context("Failed to serialize birthday store")?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).context("Failed to create birthday store directory")?;
        }
        fs::write(&self.path, content).context("Failed to write birthday store")?;
        Ok(())
    }

    /// 変更を適用して保存する。保存に失敗した場合は変更を取り消す。
    fn commit<T>(&mut self, change: impl FnOnce(&mut Self) -> T) -> Result<T> {
        let records = self.records.clone();
        let announced = self.announced.clone();
        let value = change(self);
        if let Err(e) = self.save() {
            self.records = records;
            self.announced = announced;
            return Err(e);
        }
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, guild_id: u64, user_id: u64) -> Option<&BirthdayRecord> {
        self.records.get(&(guild_id, user_id))
    }

    /// レコードを追加する。同じユーザーのレコードがあれば置き換える。
    pub fn insert(&mut self, record: BirthdayRecord) -> Result<()> {
        self.commit(|store| {
            store.records.insert(record.key(), record);
        })
    }

    /// レコードを削除し、削除したレコードを返す。
    pub fn remove(&mut self, guild_id: u64, user_id: u64) -> Result<Option<BirthdayRecord>> {
        if !self.records.contains_key(&(guild_id, user_id)) {
            return Ok(None);
        }
        self.commit(|store| store.records.remove(&(guild_id, user_id)))
    }

    /// 次のリマインダー日時を更新する。レコードがなければ false を返す。
    pub fn reschedule(&mut self, guild_id: u64, user_id: u64, next: DateTime<Utc>) -> Result<bool> {
        if !self.records.contains_key(&(guild_id, user_id)) {
            return Ok(false);
        }
        self.commit(|store| {
            if let Some(record) = store.records.get_mut(&(guild_id, user_id)) {
                record.next_reminder = next;
            }
            true
        })
    }

    /// お祝いメッセージを送信した日時を記録する。
    pub fn mark_announced(&mut self, guild_id: u64, user_id: u64, at: DateTime<Utc>) -> Result<()> {
        self.commit(|store| {
            store.announced.insert((guild_id, user_id), at);
        })
    }

    /// 最後にお祝いメッセージを送信した日時。
    pub fn last_announced(&self, guild_id: u64, user_id: u64) -> Option<DateTime<Utc>> {
        self.announced.get(&(guild_id, user_id)).copied()
    }

    /// ギルドの誕生日を、`reference` から見て近い順に返す。
    pub fn guild_birthdays(&self, guild_id: u64, reference: DateTime<Utc>) -> Vec<&BirthdayRecord> {
        let mut list: Vec<&BirthdayRecord> = self
            .records
            .values()
            .filter(|r| r.guild_id == guild_id)
            .collect();

        list.sort_by_key(|r| {
            let month = r.date.month().number_from_month();
            let day = i32::from(r.date.day());
            let passed = compare_to_today(r.date.month(), day, reference) == Ordering::Less;
            (passed, month, day, r.user_id)
        });
        list
    }

    /// `reference` の日付 (UTC) が誕生日のレコードを返す。
    pub fn todays_birthdays(&self, guild_id: u64, reference: DateTime<Utc>) -> Vec<&BirthdayRecord> {
        let mut list: Vec<&BirthdayRecord> = self
            .records
            .values()
            .filter(|r| r.guild_id == guild_id && r.date.is_on(reference))
            .collect();
        list.sort_by_key(|r| r.user_id);
        list
    }

    /// リマインダー日時が `now` 以前のレコードを古い順に返す。
    pub fn due(&self, now: DateTime<Utc>) -> Vec<BirthdayRecord> {
        let mut list: Vec<BirthdayRecord> = self
            .records
            .values()
            .filter(|r| r.next_reminder <= now)
            .cloned()
            .collect();
        list.sort_by_key(|r| (r.next_reminder, r.key()));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use birthdayy_core::Month;
    use chrono::TimeZone;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    }

    fn record(guild_id: u64, user_id: u64, month: Month, day: u8) -> BirthdayRecord {
        let now = at(2024, 1, 1);
        BirthdayRecord {
            guild_id,
            user_id,
            date: CalendarDate::new(month, day, None, now).unwrap(),
            next_reminder: now,
            created_at: now,
        }
    }

    fn empty_store() -> (NamedTempFile, BirthdayStore) {
        let temp = NamedTempFile::new().unwrap();
        std::fs::remove_file(temp.path()).ok();
        let store = BirthdayStore::load(temp.path()).unwrap();
        (temp, store)
    }

    #[test]
    fn load_empty_store() {
        let (_temp, store) = empty_store();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn insert_get_and_reload() {
        let (temp, mut store) = empty_store();

        store.insert(record(1, 10, Month::May, 10)).unwrap();
        assert!(store.get(1, 10).is_some());
        assert!(store.get(1, 11).is_none());
        assert!(store.get(2, 10).is_none());

        let reloaded = BirthdayStore::load(temp.path()).unwrap();
        assert_eq!(reloaded.get(1, 10), store.get(1, 10));
    }

    #[test]
    fn insert_replaces_existing() {
        let (_temp, mut store) = empty_store();

        store.insert(record(1, 10, Month::May, 10)).unwrap();
        store.insert(record(1, 10, Month::June, 1)).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(1, 10).unwrap().date.month(), Month::June);
    }

    #[test]
    fn remove_record() {
        let (temp, mut store) = empty_store();
        store.insert(record(1, 10, Month::May, 10)).unwrap();

        assert!(store.remove(1, 10).unwrap().is_some());
        assert!(store.remove(1, 10).unwrap().is_none());

        let reloaded = BirthdayStore::load(temp.path()).unwrap();
        assert_eq!(reloaded.len(), 0);
    }

    #[test]
    fn reschedule_record() {
        let (_temp, mut store) = empty_store();
        store.insert(record(1, 10, Month::May, 10)).unwrap();

        assert!(store.reschedule(1, 10, at(2024, 5, 10)).unwrap());
        assert!(!store.reschedule(1, 99, at(2024, 5, 10)).unwrap());
        assert_eq!(store.get(1, 10).unwrap().next_reminder, at(2024, 5, 10));
    }

    #[test]
    fn guild_birthdays_in_upcoming_order() {
        let (_temp, mut store) = empty_store();
        store.insert(record(1, 10, Month::January, 5)).unwrap();
        store.insert(record(1, 11, Month::December, 24)).unwrap();
        store.insert(record(1, 12, Month::March, 18)).unwrap();
        store.insert(record(1, 13, Month::June, 1)).unwrap();
        store.insert(record(2, 14, Month::April, 1)).unwrap();

        let users: Vec<u64> = store
            .guild_birthdays(1, at(2021, 3, 18))
            .iter()
            .map(|r| r.user_id)
            .collect();
        assert_eq!(users, vec![12, 13, 11, 10]);
    }

    #[test]
    fn todays_birthdays_filters_guild_and_day() {
        let (_temp, mut store) = empty_store();
        store.insert(record(1, 10, Month::March, 18)).unwrap();
        store.insert(record(1, 11, Month::March, 19)).unwrap();
        store.insert(record(2, 12, Month::March, 18)).unwrap();

        let today = store.todays_birthdays(1, at(2021, 3, 18));
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].user_id, 10);
    }

    #[test]
    fn due_records() {
        let (_temp, mut store) = empty_store();
        store.insert(record(1, 10, Month::May, 10)).unwrap();
        store.insert(record(1, 11, Month::May, 11)).unwrap();
        store.reschedule(1, 10, at(2021, 5, 10)).unwrap();
        store.reschedule(1, 11, at(2021, 5, 11)).unwrap();

        assert!(store.due(at(2021, 5, 9)).is_empty());
        assert_eq!(store.due(at(2021, 5, 10)).len(), 1);

        let due: Vec<u64> = store.due(at(2021, 6, 1)).iter().map(|r| r.user_id).collect();
        assert_eq!(due, vec![10, 11]);
    }

    #[test]
    fn load_existing_store() {
        let mut temp = NamedTempFile::new().unwrap();
        let json = r#"{"birthdays":[{"guild_id":1,"user_id":10,"date":{"month":2,"day":29},"next_reminder":"2025-03-01T00:00:00Z","created_at":"2024-02-01T00:00:00Z"}]}"#;
        temp.write_all(json.as_bytes()).unwrap();

        let store = BirthdayStore::load(temp.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(1, 10).unwrap().date.day(), 29);
    }

    #[test]
    fn load_rejects_invalid_date() {
        let mut temp = NamedTempFile::new().unwrap();
        let json = r#"{"birthdays":[{"guild_id":1,"user_id":10,"date":{"month":4,"day":31},"next_reminder":"2025-03-01T00:00:00Z","created_at":"2024-02-01T00:00:00Z"}]}"#;
        temp.write_all(json.as_bytes()).unwrap();

        assert!(BirthdayStore::load(temp.path()).is_err());
    }

    #[test]
    fn announcements_survive_remove_and_reload() {
        let (temp, mut store) = empty_store();
        store.insert(record(1, 10, Month::May, 10)).unwrap();
        assert_eq!(store.last_announced(1, 10), None);

        store.mark_announced(1, 10, at(2021, 5, 10)).unwrap();
        store.remove(1, 10).unwrap();
        assert_eq!(store.last_announced(1, 10), Some(at(2021, 5, 10)));

        let reloaded = BirthdayStore::load(temp.path()).unwrap();
        assert_eq!(reloaded.last_announced(1, 10), Some(at(2021, 5, 10)));
        assert_eq!(reloaded.last_announced(1, 11), None);
    }

    #[test]
    fn failed_save_keeps_memory_unchanged() {
        let (_temp, mut store) = empty_store();
        store.insert(record(1, 10, Month::May, 10)).unwrap();

        // 親ディレクトリの位置にファイルがあるため保存できない
        let blocker = NamedTempFile::new().unwrap();
        store.path = blocker.path().join("birthdays.json");

        assert!(store.insert(record(1, 11, Month::June, 1)).is_err());
        assert!(store.get(1, 11).is_none());

        assert!(store.remove(1, 10).is_err());
        assert!(store.get(1, 10).is_some());

        assert!(store.reschedule(1, 10, at(2030, 5, 10)).is_err());
        assert_eq!(store.get(1, 10).unwrap().next_reminder, at(2024, 1, 1));

        assert!(store.mark_announced(1, 10, at(2021, 5, 10)).is_err());
        assert_eq!(store.last_announced(1, 10), None);
    }
}
