use std::collections::HashMap;

use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};

/// Decorative characters removed by [`MemberDirectory::normalize_key`].
/// Channel names on the upstream platform are fond of these.
const DECORATIVE_CHARS: &[char] = &[
    '!', '?', '.', ',', '\'', '"', '`', '~', '-', '_', '/', '\\', ':', ';', '(', ')', '[', ']',
    '{', '}', '♡', '☆', '★', '✦', '⚡', '・', '。', '、', '【', '】', '「', '」',
];

/// A canonical member of the tracked organization. Immutable at runtime.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Member {
    /// Canonical English/romanized name, unique case-insensitively.
    pub name: String,
    #[serde(default)]
    pub name_ja: String,
    #[serde(default)]
    pub name_ko: String,
    /// Opaque upstream channel identifier, globally unique.
    pub channel_id: String,
    #[serde(default)]
    pub aliases_ja: Vec<String>,
    #[serde(default)]
    pub aliases_ko: Vec<String>,
    #[serde(default)]
    pub is_graduated: bool,
}

/// Static member dataset with alias indexes across the three supported
/// languages. Built once at startup; lookups are read-only afterwards.
#[derive(Debug, Default)]
pub struct MemberDirectory {
    members: Vec<Member>,
    by_channel_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
    /// normalized alias -> canonical name. A function by construction:
    /// collisions abort directory construction.
    alias_map: HashMap<String, String>,
    /// Honorific/affectionate suffixes stripped by `normalize_suffix`,
    /// applied as ordered rewrite rules on the normalized form.
    suffixes: Vec<String>,
}

impl MemberDirectory {
    pub fn new(members: Vec<Member>, suffixes: Vec<String>) -> anyhow::Result<Self> {
        let mut directory = Self {
            members,
            suffixes,
            ..Self::default()
        };

        for (index, member) in directory.members.iter().enumerate() {
            if member.channel_id.is_empty() {
                bail!("member {} has no channel id", member.name);
            }

            if directory
                .by_channel_id
                .insert(member.channel_id.clone(), index)
                .is_some()
            {
                bail!("duplicate channel id {}", member.channel_id);
            }

            if directory
                .by_name
                .insert(Self::normalize(&member.name), index)
                .is_some()
            {
                bail!("duplicate member name {}", member.name);
            }
        }

        let mut alias_map = HashMap::new();

        for member in &directory.members {
            let aliases = std::iter::once(member.name.as_str())
                .chain((!member.name_ja.is_empty()).then_some(member.name_ja.as_str()))
                .chain((!member.name_ko.is_empty()).then_some(member.name_ko.as_str()))
                .chain(member.aliases_ko.iter().map(String::as_str))
                .chain(member.aliases_ja.iter().map(String::as_str));

            for alias in aliases {
                let key = Self::normalize_key(alias);

                if key.is_empty() {
                    continue;
                }

                match alias_map.insert(key, member.name.clone()) {
                    Some(previous) if previous != member.name => {
                        return Err(anyhow!(
                            "alias {} maps to both {} and {}",
                            alias,
                            previous,
                            member.name
                        ));
                    }
                    _ => {}
                }
            }
        }

        directory.alias_map = alias_map;
        Ok(directory)
    }

    /// Unicode-casefold plus whitespace trim.
    #[must_use]
    pub fn normalize(input: &str) -> String {
        input.trim().to_lowercase()
    }

    /// `normalize` plus removal of decorative punctuation and inner
    /// whitespace, giving the key form used by the alias map.
    #[must_use]
    pub fn normalize_key(input: &str) -> String {
        Self::normalize(input)
            .chars()
            .filter(|c| !c.is_whitespace() && !DECORATIVE_CHARS.contains(c))
            .collect()
    }

    /// `normalize_key` plus stripping of configured honorific suffixes,
    /// longest first so that compound suffixes win.
    #[must_use]
    pub fn normalize_suffix(&self, input: &str) -> String {
        let mut key = Self::normalize_key(input);

        let mut ordered: Vec<&String> = self.suffixes.iter().collect();
        ordered.sort_by_key(|s| std::cmp::Reverse(s.chars().count()));

        for suffix in ordered {
            if let Some(stripped) = key.strip_suffix(suffix.as_str()) {
                if !stripped.is_empty() {
                    key = stripped.to_owned();
                    break;
                }
            }
        }

        key
    }

    #[must_use]
    pub fn find_by_channel_id(&self, channel_id: &str) -> Option<&Member> {
        self.by_channel_id
            .get(channel_id)
            .map(|&index| &self.members[index])
    }

    /// Case-insensitive exact match on the canonical name.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&Member> {
        self.by_name
            .get(&Self::normalize(name))
            .map(|&index| &self.members[index])
    }

    /// Exact lookup in the alias map, after suffix normalization.
    #[must_use]
    pub fn find_by_alias(&self, alias: &str) -> Option<&Member> {
        let key = self.normalize_suffix(alias);

        self.alias_map
            .get(&key)
            .and_then(|name| self.find_by_name(name))
    }

    #[must_use]
    pub fn get_all_members(&self) -> &[Member] {
        &self.members
    }

    pub fn get_channel_ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.channel_id.as_str())
    }

    /// All (normalized alias, canonical name) pairs, for substring scans.
    pub fn aliases(&self) -> impl Iterator<Item = (&str, &str)> {
        self.alias_map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pekora() -> Member {
        Member {
            name: "Usada Pekora".into(),
            name_ja: "兎田ぺこら".into(),
            name_ko: "우사다 페코라".into(),
            channel_id: "UC_pekora".into(),
            aliases_ja: vec!["ぺこーら".into()],
            aliases_ko: vec!["페코라".into(), "페코".into()],
            is_graduated: false,
        }
    }

    fn aqua() -> Member {
        Member {
            name: "Minato Aqua".into(),
            name_ja: "湊あくあ".into(),
            name_ko: "미나토 아쿠아".into(),
            channel_id: "UC_aqua".into(),
            aliases_ja: vec![],
            aliases_ko: vec!["아쿠아".into()],
            is_graduated: true,
        }
    }

    fn directory() -> MemberDirectory {
        MemberDirectory::new(vec![pekora(), aqua()], vec!["쨩".into(), "짱".into()]).unwrap()
    }

    #[test]
    fn alias_lookup_covers_all_languages() {
        let dir = directory();

        assert_eq!(dir.find_by_alias("페코라").unwrap().name, "Usada Pekora");
        assert_eq!(dir.find_by_alias("ぺこーら").unwrap().name, "Usada Pekora");
        assert_eq!(dir.find_by_alias("兎田ぺこら").unwrap().name, "Usada Pekora");
        assert_eq!(dir.find_by_alias("usada pekora").unwrap().name, "Usada Pekora");
        assert!(dir.find_by_alias("unknown").is_none());
    }

    #[test]
    fn honorific_suffix_is_stripped() {
        let dir = directory();

        assert_eq!(dir.find_by_alias("페코라쨩").unwrap().name, "Usada Pekora");
        // A bare suffix must not collapse to the empty key.
        assert!(dir.find_by_alias("쨩").is_none());
    }

    #[test]
    fn key_normalization_drops_decoration_and_whitespace() {
        assert_eq!(
            MemberDirectory::normalize_key("  Usada-Pekora!! "),
            "usadapekora"
        );
        assert_eq!(MemberDirectory::normalize_key("湊あくあ☆"), "湊あくあ");
    }

    #[test]
    fn alias_collision_is_fatal() {
        let mut other = aqua();
        other.aliases_ko = vec!["페코라".into()];

        let result = MemberDirectory::new(vec![pekora(), other], vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_channel_id_is_fatal() {
        let mut other = aqua();
        other.channel_id = "UC_pekora".into();

        assert!(MemberDirectory::new(vec![pekora(), other], vec![]).is_err());
    }

    #[test]
    fn lookup_by_channel_id_and_name() {
        let dir = directory();

        assert_eq!(dir.find_by_channel_id("UC_aqua").unwrap().name, "Minato Aqua");
        assert_eq!(dir.find_by_name("MINATO AQUA").unwrap().channel_id, "UC_aqua");
        assert_eq!(dir.get_all_members().len(), 2);
        assert_eq!(dir.get_channel_ids().count(), 2);
    }
}
