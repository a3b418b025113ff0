//! Line-to-event ownership check.
//!
//! Upstream attaches a free-text event description to every proposal. Before a
//! line is stored under an event we check that text against the event's two
//! participant names. The rule is conservative on purpose: dropping a valid
//! line costs one missed update, attributing a line to the wrong event puts a
//! ghost price in front of the bettor.

/// Filler tokens stripped when deriving a name's key form.
const FILLER_TOKENS: &[&str] = &[
    "the", "of", "state", "university", "college", "univ", "fc", "sc", "afc", "cf",
];

/// Separators upstream uses between participant names.
const JOIN_SEPARATORS: &[&str] = &["vs", "vs.", "v", "@", "at", "-"];

/// Per-side match signals. Exposed so rejections can be logged with the reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SideSignals {
    pub full: bool,
    pub key_word: bool,
    pub any_word: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchSignals {
    pub home: SideSignals,
    pub away: SideSignals,
    pub joined: bool,
}

impl MatchSignals {
    /// The acceptance rule.
    #[inline]
    pub fn accepted(&self) -> bool {
        (self.home.full && self.away.full)
            || self.joined
            || (self.home.key_word && self.away.key_word)
            || (self.home.full && self.away.any_word)
            || (self.away.full && self.home.any_word)
    }
}

/// Lower-case, trim and collapse internal whitespace.
pub fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(|t| t.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_filler(token: &str) -> bool {
    FILLER_TOKENS.contains(&token)
}

/// Name with filler tokens removed, whitespace collapsed.
pub fn key_form(name: &str) -> String {
    normalize(name)
        .split(' ')
        .filter(|t| !t.is_empty() && !is_filler(t))
        .collect::<Vec<_>>()
        .join(" ")
}

/// First token of the key form ("Duke Blue Devils" -> "duke").
pub fn key_word(name: &str) -> Option<String> {
    key_form(name).split(' ').find(|t| !t.is_empty()).map(str::to_string)
}

/// Key words that tell the two participants apart.
///
/// When both names share their first token ("Los Angeles Lakers" and "Los
/// Angeles Clippers") each side falls back to its first key-form token the
/// other side does not carry. None for a side with no such token.
pub fn distinct_key_words(home: &str, away: &str) -> (Option<String>, Option<String>) {
    let (home_kw, away_kw) = (key_word(home), key_word(away));
    if home_kw != away_kw {
        return (home_kw, away_kw);
    }

    let home_key = key_form(home);
    let away_key = key_form(away);
    let first_unshared = |own: &str, other: &str| {
        let other: Vec<&str> = other.split(' ').collect();
        own.split(' ')
            .find(|t| !t.is_empty() && !other.contains(t))
            .map(str::to_string)
    };
    (first_unshared(&home_key, &away_key), first_unshared(&away_key, &home_key))
}

/// Split description text into comparable tokens. Punctuation other than the
/// characters team names actually use is treated as a separator.
fn tokens(text: &str) -> Vec<&str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '&' || c == '.'))
        .map(|t| t.trim_matches('.'))
        .filter(|t| !t.is_empty())
        .collect()
}

fn side_signals(desc: &str, desc_tokens: &[&str], name: &str, key_word: Option<&str>) -> SideSignals {
    let full_name = normalize(name);
    if full_name.is_empty() {
        return SideSignals::default();
    }

    let full = desc.contains(&full_name);
    let key_word = key_word
        .map(|kw| desc_tokens.iter().any(|t| *t == kw))
        .unwrap_or(false);
    let any_word = tokens(&full_name)
        .into_iter()
        .filter(|w| w.chars().count() > 2 && !is_filler(w))
        .any(|w| desc_tokens.contains(&w));

    SideSignals { full, key_word, any_word }
}

fn joined_pattern(desc: &str, home: &str, away: &str) -> bool {
    if home.is_empty() || away.is_empty() {
        return false;
    }
    JOIN_SEPARATORS.iter().any(|sep| {
        desc.contains(&format!("{home} {sep} {away}")) || desc.contains(&format!("{away} {sep} {home}"))
    })
}

/// Compute every signal for a description against an event's participants.
pub fn match_signals(event_description: &str, home: &str, away: &str) -> MatchSignals {
    let desc = normalize(event_description);
    if desc.is_empty() {
        return MatchSignals::default();
    }
    let desc_tokens = tokens(&desc);
    let (home_kw, away_kw) = distinct_key_words(home, away);

    MatchSignals {
        home: side_signals(&desc, &desc_tokens, home, home_kw.as_deref()),
        away: side_signals(&desc, &desc_tokens, away, away_kw.as_deref()),
        joined: joined_pattern(&desc, &normalize(home), &normalize(away)),
    }
}

/// True if a line carrying `event_description` may be stored under the event
/// whose participants are `home` and `away`.
pub fn line_belongs_to_event(event_description: &str, home: &str, away: &str) -> bool {
    match_signals(event_description, home, away).accepted()
}
