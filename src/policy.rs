use std::collections::HashSet;

/// Country include/exclude filter applied to geo lookup results.
///
/// Names are compared after trimming and lowercasing. A country listed in `exclude` is
/// always dropped, even if it also appears in `include`.
#[derive(Debug, Clone, Default)]
pub struct CountryPolicy {
    exclude: Option<HashSet<String>>,
    include: Option<HashSet<String>>,
}

pub fn normalize_country(name: &str) -> String {
    name.trim().to_lowercase()
}

fn normalize_set<I, S>(names: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|n| normalize_country(n.as_ref()))
        .filter(|n| !n.is_empty())
        .collect()
}

/// Why a country was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVerdict {
    Keep,
    Excluded,
    NotIncluded,
}

impl CountryPolicy {
    pub fn new<E, I, S>(exclude: Option<E>, include: Option<I>) -> Self
    where
        E: IntoIterator<Item = S>,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let exclude = exclude.map(normalize_set).filter(|s| !s.is_empty());
        let include = include.map(normalize_set).filter(|s| !s.is_empty());
        Self { exclude, include }
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn verdict(&self, country: &str) -> PolicyVerdict {
        let country = normalize_country(country);
        if self.exclude.as_ref().is_some_and(|ex| ex.contains(&country)) {
            return PolicyVerdict::Excluded;
        }
        match &self.include {
            Some(inc) if !inc.contains(&country) => PolicyVerdict::NotIncluded,
            _ => PolicyVerdict::Keep,
        }
    }

    pub fn allows(&self, country: &str) -> bool {
        self.verdict(country) == PolicyVerdict::Keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_everything() {
        let p = CountryPolicy::allow_all();
        assert!(p.allows("Germany"));
        assert!(p.allows("Unknown"));
    }

    #[test]
    fn matching_is_trimmed_and_case_insensitive() {
        let p = CountryPolicy::new(Some(vec!["  germany "]), None::<Vec<&str>>);
        assert_eq!(p.verdict("GERMANY"), PolicyVerdict::Excluded);
        assert!(p.allows("France"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let p = CountryPolicy::new(Some(vec!["France"]), Some(vec!["France", "Spain"]));
        assert_eq!(p.verdict("France"), PolicyVerdict::Excluded);
        assert_eq!(p.verdict("Spain"), PolicyVerdict::Keep);
        assert_eq!(p.verdict("Italy"), PolicyVerdict::NotIncluded);
    }

    #[test]
    fn empty_include_list_includes_all() {
        let p = CountryPolicy::new(Some(Vec::<&str>::new()), Some(Vec::<&str>::new()));
        assert_eq!(p.verdict("Germany"), PolicyVerdict::Keep);
    }

    #[test]
    fn include_rejects_unknown_country() {
        let p = CountryPolicy::new(None::<Vec<&str>>, Some(vec!["Japan"]));
        assert_eq!(p.verdict("Unknown"), PolicyVerdict::NotIncluded);
    }
}
