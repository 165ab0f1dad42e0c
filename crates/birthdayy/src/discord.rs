use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use birthdayy_core::{compute_age, format_for_display, month_from_number};
use chrono::{DateTime, Utc};
use serenity::all::{
    ActivityData, Command, CommandInteraction, CreateCommand, CreateCommandOption, CreateEmbed,
    CreateInteractionResponse, CreateInteractionResponseMessage, CreateMessage, GatewayIntents,
    Guild, Mentionable, ResolvedOption, ResolvedValue, UserId,
};
use serenity::async_trait;
use serenity::builder::CreateEmbedFooter;
use serenity::client::Context as SerenityContext;
use serenity::model::application::CommandOptionType;
use serenity::prelude::*;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::input::DateInput;
use crate::reminder::{
    announce, local_reference, run_reminder_loop, schedule, schedule_new, schedule_update,
};
use crate::store::{BirthdayRecord, SharedStore};
use crate::version::FOOTER;

const SUCCESS_COLOR: u32 = 0x00ff00;
const FAILURE_COLOR: u32 = 0xff0000;

/// プレゼンスに表示するアクティビティ。
const ACTIVITY: &str = "/birthday register 🎂";

/// Discord の埋め込みに追加できるフィールドの上限。
const MAX_EMBED_FIELDS: usize = 25;

pub struct Handler {
    config: Arc<Config>,
    store: SharedStore,
    reminder_started: AtomicBool,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: SerenityContext, ready: serenity::model::gateway::Ready) {
        info!(user = %ready.user.name, "Bot connected");
        ctx.set_activity(Some(ActivityData::watching(ACTIVITY)));

        if let Err(e) = Command::set_global_commands(&ctx.http, vec![birthday_command()]).await {
            error!(error = %e, "Failed to register commands");
        } else {
            info!("Slash commands registered");
        }

        // 再接続のたびに ready が呼ばれるため、リマインダーは一度だけ起動する
        if !self.reminder_started.swap(true, Ordering::SeqCst) {
            let http = ctx.http.clone();
            let config = self.config.clone();
            let store = self.store.clone();
            tokio::spawn(async move {
                run_reminder_loop(http, config, store).await;
            });
        }
    }

    async fn guild_create(&self, ctx: SerenityContext, guild: Guild, is_new: Option<bool>) {
        if is_new != Some(true) {
            return;
        }
        info!(guild_id = %guild.id, name = %guild.name, "Joined guild");

        let message = CreateMessage::new().embed(guide_embed());
        if let Err(e) = guild.owner_id.direct_message(&ctx, message).await {
            warn!(guild_id = %guild.id, error = %e, "Failed to send guide to guild owner");
        }
    }

    async fn interaction_create(
        &self,
        ctx: SerenityContext,
        interaction: serenity::model::application::Interaction,
    ) {
        if let serenity::model::application::Interaction::Command(command) = interaction
            && let Err(e) = self.handle_command(&ctx, &command).await
        {
            error!(error = %e, command = %command.data.name, "Command error");

            let response = CreateInteractionResponseMessage::new()
                .content(format!("Error: {}", e))
                .ephemeral(true);

            if let Err(e) = command
                .create_response(&ctx.http, CreateInteractionResponse::Message(response))
                .await
            {
                error!(error = %e, "Failed to send error response");
            }
        }
    }
}

/// サブコマンドの呼び出し情報。
struct Invocation<'a> {
    guild_id: u64,
    author_id: u64,
    subcommand: &'a str,
    options: Vec<ResolvedOption<'a>>,
}

impl Invocation<'_> {
    /// `user` オプションで指定されたユーザー。省略時は実行者。
    fn target(&self) -> u64 {
        self.options
            .iter()
            .find(|opt| opt.name == "user")
            .and_then(|opt| match opt.value {
                ResolvedValue::User(user, _) => Some(user.id.get()),
                _ => None,
            })
            .unwrap_or(self.author_id)
    }

    fn integer(&self, name: &str) -> Option<i64> {
        self.options
            .iter()
            .find(|opt| opt.name == name)
            .and_then(|opt| match opt.value {
                ResolvedValue::Integer(value) => Some(value),
                _ => None,
            })
    }

    fn date_input(&self) -> DateInput {
        DateInput {
            day: self.integer("day"),
            month: self.integer("month"),
            year: self.integer("year"),
        }
    }
}

impl Handler {
    async fn handle_command(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
    ) -> Result<()> {
        if command.data.name != "birthday" {
            return Ok(());
        }

        let Some(guild_id) = command.guild_id else {
            return respond(
                ctx,
                command,
                failure("This command can only be used in a server."),
            )
            .await;
        };

        let Some((subcommand, options)) =
            command
                .data
                .options()
                .into_iter()
                .find_map(|opt| match opt.value {
                    ResolvedValue::SubCommand(options) => Some((opt.name, options)),
                    _ => None,
                })
        else {
            return Ok(());
        };

        let invocation = Invocation {
            guild_id: guild_id.get(),
            author_id: command.user.id.get(),
            subcommand,
            options,
        };
        let now = Utc::now();

        match invocation.subcommand {
            "register" => self.handle_register(ctx, command, &invocation, now).await,
            "update" => self.handle_update(ctx, command, &invocation, now).await,
            "remove" => self.handle_remove(ctx, command, &invocation).await,
            "show" => self.handle_show(ctx, command, &invocation, now).await,
            "list" => self.handle_list(ctx, command, &invocation, now).await,
            "test" => self.handle_test(ctx, command, &invocation, now).await,
            _ => Ok(()),
        }
    }

    /// 他のユーザーの誕生日を管理できるかどうか。
    fn can_manage_others(&self, command: &CommandInteraction) -> bool {
        self.config.discord.admins.contains(&command.user.id.get())
            || command
                .member
                .as_ref()
                .and_then(|member| member.permissions)
                .is_some_and(|permissions| permissions.manage_roles())
    }

    /// 他のユーザーを対象にする場合に権限を確認する。
    async fn check_target(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
        invocation: &Invocation<'_>,
        action: &str,
    ) -> Result<Option<u64>> {
        let target = invocation.target();
        if target != invocation.author_id && !self.can_manage_others(command) {
            warn!(user_id = invocation.author_id, target, "Unauthorized access attempt");
            respond(
                ctx,
                command,
                failure(format!(
                    "You don't have the permission to {action} other users' birthdays."
                )),
            )
            .await?;
            return Ok(None);
        }
        Ok(Some(target))
    }

    async fn handle_register(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
        invocation: &Invocation<'_>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(target) = self.check_target(ctx, command, invocation, "register").await? else {
            return Ok(());
        };

        let guild_id = invocation.guild_id;
        let tz = self.config.timezone_for(guild_id);
        let date = match invocation.date_input().parse(local_reference(now, tz)) {
            Ok(date) => date,
            Err(e) => return respond(ctx, command, failure(e.to_string())).await,
        };

        let inserted = {
            let mut store = self.store.lock().await;
            if store.get(guild_id, target).is_some() {
                None
            } else {
                let next_reminder =
                    schedule_new(date, now, tz, store.last_announced(guild_id, target))?;
                store
                    .insert(BirthdayRecord {
                        guild_id,
                        user_id: target,
                        date,
                        next_reminder,
                        created_at: now,
                    })
                    .context("Failed to register birthday")?;
                Some(next_reminder)
            }
        };

        let Some(next_reminder) = inserted else {
            return respond(
                ctx,
                command,
                failure("This user's birthday is already registered. Use `/birthday update` instead."),
            )
            .await;
        };

        info!(guild_id, user_id = target, date = %date, next_reminder = %next_reminder, "Birthday registered");

        let embed = success("📖 Birthday Registered")
            .description(format!(
                "The birthday of {} was successfully registered.",
                UserId::new(target).mention()
            ))
            .field("Date", format_for_display(date), true);
        respond(ctx, command, embed).await
    }

    async fn handle_update(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
        invocation: &Invocation<'_>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(target) = self.check_target(ctx, command, invocation, "update").await? else {
            return Ok(());
        };

        let guild_id = invocation.guild_id;
        let tz = self.config.timezone_for(guild_id);
        let date = match invocation.date_input().parse(local_reference(now, tz)) {
            Ok(date) => date,
            Err(e) => return respond(ctx, command, failure(e.to_string())).await,
        };

        let updated = {
            let mut store = self.store.lock().await;
            match store.get(guild_id, target).cloned() {
                Some(existing) => {
                    let last_announced = store.last_announced(guild_id, target);
                    let next_reminder = schedule_update(&existing, date, now, tz, last_announced)?;
                    store
                        .insert(BirthdayRecord {
                            date,
                            next_reminder,
                            ..existing
                        })
                        .context("Failed to update birthday")?;
                    Some(next_reminder)
                }
                None => None,
            }
        };

        let Some(next_reminder) = updated else {
            return respond(
                ctx,
                command,
                failure("This user doesn't have a birthday registered."),
            )
            .await;
        };

        info!(guild_id, user_id = target, date = %date, next_reminder = %next_reminder, "Birthday updated");

        let embed = success("✅ Birthday Updated").description(format!(
            "The birthday of {} is now the {}. 🎂",
            UserId::new(target).mention(),
            date
        ));
        respond(ctx, command, embed).await
    }

    async fn handle_remove(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
        invocation: &Invocation<'_>,
    ) -> Result<()> {
        let Some(target) = self.check_target(ctx, command, invocation, "remove").await? else {
            return Ok(());
        };

        let guild_id = invocation.guild_id;
        let removed = self
            .store
            .lock()
            .await
            .remove(guild_id, target)
            .context("Failed to remove birthday")?;

        if removed.is_none() {
            return respond(ctx, command, failure("This user has no birthday registered.")).await;
        }

        info!(guild_id, user_id = target, "Birthday removed");

        let embed = success("📖 Birthday Removed").description(format!(
            "The birthday of {} was successfully removed.",
            UserId::new(target).mention()
        ));
        respond(ctx, command, embed).await
    }

    async fn handle_show(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
        invocation: &Invocation<'_>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let target = invocation.target();
        let guild_id = invocation.guild_id;
        let record = self.store.lock().await.get(guild_id, target).cloned();

        let Some(record) = record else {
            return respond(
                ctx,
                command,
                failure("This user doesn't have a birthday registered."),
            )
            .await;
        };

        let tz = self.config.timezone_for(guild_id);
        let next = schedule(record.date, now, tz, false)?;

        let mut embed = success("🎂 Birthday").description(format!(
            "{}'s birthday is on the {}.",
            UserId::new(target).mention(),
            record.date
        ));
        if let Some(age) = compute_age(record.date, local_reference(now, tz)) {
            embed = embed.field("Age", age.to_string(), true);
        }
        embed = embed.field(
            "Next birthday",
            format!("<t:{0}:D> (<t:{0}:R>)", next.timestamp()),
            true,
        );

        respond(ctx, command, embed).await
    }

    async fn handle_list(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
        invocation: &Invocation<'_>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let guild_id = invocation.guild_id;
        let reference = local_reference(now, self.config.timezone_for(guild_id));

        let embed = {
            let store = self.store.lock().await;
            let birthdays = store.guild_birthdays(guild_id, reference);
            let today: Vec<u64> = store
                .todays_birthdays(guild_id, reference)
                .iter()
                .map(|r| r.user_id)
                .collect();

            let mut embed = success("📖 Birthday List");
            if birthdays.is_empty() {
                embed = embed.description("No birthdays registered yet.");
            }
            for record in birthdays.iter().take(MAX_EMBED_FIELDS) {
                let name = if today.contains(&record.user_id) {
                    format!("🎂 {}", record.date)
                } else {
                    record.date.to_string()
                };
                embed = embed.field(name, UserId::new(record.user_id).mention().to_string(), true);
            }
            embed.footer(CreateEmbedFooter::new(format!(
                "{} · Total: {} birthday(s)",
                FOOTER,
                birthdays.len()
            )))
        };

        respond(ctx, command, embed).await
    }

    async fn handle_test(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
        invocation: &Invocation<'_>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.can_manage_others(command) {
            warn!(user_id = invocation.author_id, "Unauthorized access attempt");
            return respond(
                ctx,
                command,
                failure("You don't have the permission to run this command."),
            )
            .await;
        }

        let guild_id = invocation.guild_id;
        let Some(guild) = self.config.find_guild(guild_id) else {
            return respond(
                ctx,
                command,
                failure("This server has no birthday channel configured."),
            )
            .await;
        };

        let tz = self.config.timezone_for(guild_id);
        let record = self
            .store
            .lock()
            .await
            .get(guild_id, invocation.author_id)
            .cloned();
        let age = record.and_then(|r| compute_age(r.date, local_reference(now, tz)));

        announce(
            &ctx.http,
            guild.channel_id,
            guild.role_id,
            self.config.message_for(guild_id),
            invocation.author_id,
            age,
        )
        .await?;

        info!(guild_id, user_id = invocation.author_id, "Birthday test run");
        respond(ctx, command, success("✅ Birthday Test Run!")).await
    }
}

fn success(title: &str) -> CreateEmbed {
    CreateEmbed::new()
        .title(title)
        .color(SUCCESS_COLOR)
        .footer(CreateEmbedFooter::new(FOOTER))
}

fn failure(description: impl Into<String>) -> CreateEmbed {
    CreateEmbed::new()
        .title("❌ Failed")
        .description(description)
        .color(FAILURE_COLOR)
}

/// 実行者にだけ見えるメッセージで応答する。
async fn respond(
    ctx: &SerenityContext,
    command: &CommandInteraction,
    embed: CreateEmbed,
) -> Result<()> {
    let response = CreateInteractionResponseMessage::new()
        .embed(embed)
        .ephemeral(true);

    command
        .create_response(&ctx.http, CreateInteractionResponse::Message(response))
        .await?;

    Ok(())
}

/// サーバーに追加されたときにオーナーへ送る使い方の案内。
fn guide_embed() -> CreateEmbed {
    success("🎂 Thanks for adding Birthdayy!")
        .description("Members can register their birthday and get congratulated on the day.")
        .field(
            "Register",
            "`/birthday register day month [year]` registers your birthday.",
            false,
        )
        .field(
            "Manage",
            "`/birthday update`, `/birthday remove` and `/birthday show` manage a birthday. \
             Members with Manage Roles can act on other users.",
            false,
        )
        .field("List", "`/birthday list` shows the upcoming birthdays.", false)
        .field(
            "Setup",
            "Add a `[[guilds]]` entry with the announcement channel to the bot configuration, \
             then try it with `/birthday test`.",
            false,
        )
}

fn day_option() -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::Integer, "day", "Day of the month")
        .min_int_value(1)
        .max_int_value(31)
        .required(true)
}

fn month_option() -> CreateCommandOption {
    (1..=12u32)
        .filter_map(|n| month_from_number(n).ok().map(|month| (n, month)))
        .fold(
            CreateCommandOption::new(CommandOptionType::Integer, "month", "Month").required(true),
            |option, (n, month)| option.add_int_choice(month.name(), n as i32),
        )
}

fn year_option() -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::Integer, "year", "Year of birth")
        .min_int_value(crate::input::MIN_YEAR as u64)
}

fn user_option(description: &str) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::User, "user", description)
}

fn date_subcommand(name: &str, description: &str) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::SubCommand, name, description)
        .add_sub_option(day_option())
        .add_sub_option(month_option())
        .add_sub_option(year_option())
        .add_sub_option(user_option("Whose birthday (requires Manage Roles)"))
}

fn birthday_command() -> CreateCommand {
    CreateCommand::new("birthday")
        .description("Manage birthdays")
        .add_option(date_subcommand("register", "Register a birthday"))
        .add_option(date_subcommand("update", "Update a registered birthday"))
        .add_option(
            CreateCommandOption::new(CommandOptionType::SubCommand, "remove", "Remove a birthday")
                .add_sub_option(user_option("Whose birthday (requires Manage Roles)")),
        )
        .add_option(
            CreateCommandOption::new(CommandOptionType::SubCommand, "show", "Show a birthday")
                .add_sub_option(user_option("Whose birthday")),
        )
        .add_option(CreateCommandOption::new(
            CommandOptionType::SubCommand,
            "list",
            "List the birthdays of this server",
        ))
        .add_option(CreateCommandOption::new(
            CommandOptionType::SubCommand,
            "test",
            "Send a test birthday message for yourself",
        ))
}

pub async fn run(config: Arc<Config>, store: SharedStore) -> Result<()> {
    let intents = GatewayIntents::GUILDS;
    let handler = Handler {
        config: config.clone(),
        store,
        reminder_started: AtomicBool::new(false),
    };

    let mut client = Client::builder(&config.discord.token, intents)
        .event_handler(handler)
        .await
        .context("Failed to create client")?;

    info!("Starting bot");
    client.start().await.context("Client error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_birthday_command_subcommands() {
        let json = serde_json::to_value(birthday_command()).unwrap();
        assert_eq!(json["name"], "birthday");

        let names: Vec<&str> = json["options"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|opt| opt["name"].as_str())
            .collect();
        assert_eq!(names, ["register", "update", "remove", "show", "list", "test"]);
    }

    #[test]
    fn test_month_option_choices() {
        let json = serde_json::to_value(month_option()).unwrap();
        let choices = json["choices"].as_array().unwrap();
        assert_eq!(choices.len(), 12);
        assert_eq!(choices[0]["name"], "January");
        assert_eq!(choices[11]["value"], Value::from(12));
    }

    #[test]
    fn test_guide_embed() {
        let json = serde_json::to_value(guide_embed()).unwrap();
        assert_eq!(json["title"], "🎂 Thanks for adding Birthdayy!");
        assert_eq!(json["fields"].as_array().unwrap().len(), 4);
        assert_eq!(json["footer"]["text"], FOOTER);
    }
}
