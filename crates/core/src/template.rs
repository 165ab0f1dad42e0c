//! Placeholder substitution for birthday announcements.
//!
//! A template such as `"Happy birthday {user}!{line}{age.ordinal} time around"`
//! is split into [`Token`]s once and rendered per member.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// The message used when a guild does not configure its own.
pub const DEFAULT_MESSAGE: &str = "🎂 Happy birthday, {user}!";

/// Rendered in place of an age that is not known.
pub const UNKNOWN_AGE: &str = "unknown";

/// A piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Text(String),
    /// `{age}`
    Age,
    /// `{age.ordinal}` or `{ageOrdinal}`
    AgeOrdinal,
    /// `{user}`, the member mention
    User,
    /// `{user.name}` or `{userName}`
    UserName,
    /// `{user.tag}` or `{userTag}`
    UserTag,
    /// `{line}`
    Line,
}

impl Token {
    fn placeholder(name: &str) -> Option<Self> {
        match name {
            "age" => Some(Self::Age),
            "age.ordinal" | "ageOrdinal" => Some(Self::AgeOrdinal),
            "user" => Some(Self::User),
            "user.name" | "userName" => Some(Self::UserName),
            "user.tag" | "userTag" => Some(Self::UserTag),
            "line" => Some(Self::Line),
            _ => None,
        }
    }
}

/// Values substituted into a template for one member.
#[derive(Debug, Clone, Copy)]
pub struct MessageContext<'a> {
    pub mention: &'a str,
    pub name: &'a str,
    pub tag: &'a str,
    pub age: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    tokens: Vec<Token>,
}

impl MessageTemplate {
    pub fn parse(input: &str) -> Self {
        Self {
            tokens: tokenize(input),
        }
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn render(&self, context: &MessageContext<'_>) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Text(text) => out.push_str(text),
                Token::Age => match context.age {
                    Some(age) => out.push_str(&age.to_string()),
                    None => out.push_str(UNKNOWN_AGE),
                },
                Token::AgeOrdinal => match context.age {
                    Some(age) => out.push_str(&ordinal(age)),
                    None => out.push_str(UNKNOWN_AGE),
                },
                Token::User => out.push_str(context.mention),
                Token::UserName => out.push_str(context.name),
                Token::UserTag => out.push_str(context.tag),
                Token::Line => out.push('\n'),
            }
        }
        out
    }
}

impl Default for MessageTemplate {
    fn default() -> Self {
        Self::parse(DEFAULT_MESSAGE)
    }
}

impl FromStr for MessageTemplate {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// Writes the template back out with canonical placeholder names.
impl fmt::Display for MessageTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for token in &self.tokens {
            let text = match token {
                Token::Text(text) => text.as_str(),
                Token::Age => "{age}",
                Token::AgeOrdinal => "{age.ordinal}",
                Token::User => "{user}",
                Token::UserName => "{user.name}",
                Token::UserTag => "{user.tag}",
                Token::Line => "{line}",
            };
            f.write_str(text)?;
        }
        Ok(())
    }
}

/// Splits a template into text and placeholders. Unknown `{...}` stays text.
pub fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut rest = input;

    while let Some(start) = rest.find('{') {
        text.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        let placeholder = after
            .find('}')
            .and_then(|end| Token::placeholder(&after[..end]).map(|token| (end, token)));

        match placeholder {
            Some((end, token)) => {
                if !text.is_empty() {
                    tokens.push(Token::Text(std::mem::take(&mut text)));
                }
                tokens.push(token);
                rest = &after[end + 1..];
            }
            None => {
                text.push('{');
                rest = after;
            }
        }
    }

    text.push_str(rest);
    if !text.is_empty() {
        tokens.push(Token::Text(text));
    }

    tokens
}

/// English ordinal, e.g. `1st`, `12th`, `23rd`.
pub fn ordinal(n: i32) -> String {
    let suffix = match (n.rem_euclid(100), n.rem_euclid(10)) {
        (11..=13, _) => "th",
        (_, 1) => "st",
        (_, 2) => "nd",
        (_, 3) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(age: Option<i32>) -> MessageContext<'static> {
        MessageContext {
            mention: "<@42>",
            name: "alice",
            tag: "@alice",
            age,
        }
    }

    #[test]
    fn test_tokenize_plain_text() {
        assert_eq!(tokenize("hello"), vec![Token::Text("hello".to_string())]);
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn test_tokenize_placeholders() {
        assert_eq!(
            tokenize("Hi {user}{line}you are {age}"),
            vec![
                Token::Text("Hi ".to_string()),
                Token::User,
                Token::Line,
                Token::Text("you are ".to_string()),
                Token::Age,
            ]
        );
    }

    #[test]
    fn test_tokenize_aliases() {
        assert_eq!(
            tokenize("{ageOrdinal}{age.ordinal}{userName}{user.name}{userTag}{user.tag}"),
            vec![
                Token::AgeOrdinal,
                Token::AgeOrdinal,
                Token::UserName,
                Token::UserName,
                Token::UserTag,
                Token::UserTag,
            ]
        );
    }

    #[test]
    fn test_tokenize_unknown_braces_stay_literal() {
        assert_eq!(
            tokenize("{nope} {user"),
            vec![Token::Text("{nope} {user".to_string())]
        );
        assert_eq!(
            tokenize("{{age}}"),
            vec![
                Token::Text("{".to_string()),
                Token::Age,
                Token::Text("}".to_string()),
            ]
        );
    }

    #[test]
    fn test_render() {
        let template = MessageTemplate::parse("{user} ({user.name}, {userTag}) turns {age}!{line}{age.ordinal}");
        assert_eq!(
            template.render(&context(Some(21))),
            "<@42> (alice, @alice) turns 21!\n21st"
        );
    }

    #[test]
    fn test_parse_keeps_tokens() {
        let template = MessageTemplate::parse("Hi {userName}!");
        assert_eq!(
            template.tokens(),
            [
                Token::Text("Hi ".to_string()),
                Token::UserName,
                Token::Text("!".to_string()),
            ]
        );
        assert!(MessageTemplate::parse("").tokens().is_empty());
    }

    #[test]
    fn test_render_unknown_age() {
        let template = MessageTemplate::parse("{age}/{ageOrdinal}");
        assert_eq!(template.render(&context(None)), "unknown/unknown");
    }

    #[test]
    fn test_default_message() {
        assert_eq!(
            MessageTemplate::default().render(&context(None)),
            "🎂 Happy birthday, <@42>!"
        );
    }

    #[test]
    fn test_display_canonicalizes_aliases() {
        let template: MessageTemplate = "{userName} is {ageOrdinal} {x}".parse().unwrap();
        assert_eq!(template.to_string(), "{user.name} is {age.ordinal} {x}");
    }

    #[test]
    fn test_ordinal() {
        let cases = [
            (0, "0th"),
            (1, "1st"),
            (2, "2nd"),
            (3, "3rd"),
            (4, "4th"),
            (11, "11th"),
            (12, "12th"),
            (13, "13th"),
            (21, "21st"),
            (22, "22nd"),
            (101, "101st"),
            (111, "111th"),
        ];
        for (n, expected) in cases {
            assert_eq!(ordinal(n), expected);
        }
    }
}
