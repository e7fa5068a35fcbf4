//! 从发言中启发式提取工具输入：邮箱、首字母大写短语（公司 / 人名）、search / find / look up 之后的查询文本

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

// 模式都是常量；编译失败时对应字段不再提取，由下方测试保证全部可编译

static EMAIL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").ok());

static CAPITALIZED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][A-Za-z0-9&'-]*(?:\s+[A-Z][A-Za-z0-9&'-]*)*").ok());

static QUERY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:search(?:\s+for)?|find|look\s+up|lookup)\s+(.+?)\s*(?:[.?!]|$)").ok()
});

/// 句首常见的大写词，不当作专有名词
const LEADING_STOPWORDS: &[&str] = &[
    "a", "also", "and", "are", "but", "can", "could", "do", "does", "find", "hello", "hey", "hi",
    "i", "is", "let", "look", "my", "no", "ok", "okay", "our", "please", "so", "search", "thanks",
    "the", "we", "what", "who", "would", "yes", "you",
];

const COMPANY_SUFFIXES: &[&str] = &[
    "co", "company", "corp", "corporation", "gmbh", "group", "inc", "labs", "llc", "ltd",
    "technologies",
];

const COMPANY_PREPOSITIONS: &[&str] = &["at", "from"];

pub fn extract_input(text: &str) -> Map<String, Value> {
    let mut input = Map::new();

    let mut remaining = text.to_string();
    if let Some(re) = EMAIL.as_ref()
        && let Some(m) = re.find(text)
    {
        input.insert("email".into(), Value::String(m.as_str().to_string()));
        remaining = re.replace_all(text, " ").into_owned();
    }

    let (company, name) = proper_nouns(&remaining);
    if let Some(company) = company {
        input.insert("company".into(), Value::String(company));
    }
    if let Some(name) = name {
        input.insert("name".into(), Value::String(name));
    }

    let query = QUERY
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|q| !q.is_empty());
    // 没有显式查询时退化为识别出的实体
    let query = query.or_else(|| {
        ["company", "name", "email"]
            .iter()
            .find_map(|k| input.get(*k).and_then(Value::as_str).map(str::to_string))
    });
    if let Some(query) = query {
        input.insert("query".into(), Value::String(query));
    }
    input
}

/// 返回第一个像公司的短语和第一个其他短语
fn proper_nouns(text: &str) -> (Option<String>, Option<String>) {
    let Some(re) = CAPITALIZED.as_ref() else {
        return (None, None);
    };
    let mut company = None;
    let mut name = None;

    for m in re.find_iter(text) {
        let words: Vec<&str> = m
            .as_str()
            .split_whitespace()
            .skip_while(|w| LEADING_STOPWORDS.contains(&w.to_lowercase().as_str()))
            .collect();
        let Some(last) = words.last() else {
            continue;
        };
        let phrase = words.join(" ");

        let preceding = text[..m.start()]
            .split_whitespace()
            .last()
            .map(str::to_lowercase);
        let is_company = COMPANY_SUFFIXES.contains(&last.to_lowercase().as_str())
            || preceding.is_some_and(|p| COMPANY_PREPOSITIONS.contains(&p.as_str()));

        if is_company {
            company.get_or_insert(phrase);
        } else {
            name.get_or_insert(phrase);
        }
        if company.is_some() && name.is_some() {
            break;
        }
    }
    (company, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_patterns_compile() {
        assert!(EMAIL.is_some());
        assert!(CAPITALIZED.is_some());
        assert!(QUERY.is_some());
    }

    #[test]
    fn test_company_after_preposition() {
        let input = extract_input("can you look up the contact at Acme Corp");
        assert_eq!(input["company"], "Acme Corp");
        assert_eq!(input["query"], "the contact at Acme Corp");
        assert!(!input.contains_key("name"));
    }

    #[test]
    fn test_email_and_person() {
        let input = extract_input("Please send it to Jane Doe at jane.doe@acme.io.");
        assert_eq!(input["email"], "jane.doe@acme.io");
        assert_eq!(input["name"], "Jane Doe");
        // 没有 search 类动词时，query 取识别出的实体
        assert_eq!(input["query"], "Jane Doe");
    }

    #[test]
    fn test_company_suffix_and_search_phrase() {
        let input = extract_input("We work with Globex Inc. Search for pricing tiers?");
        assert_eq!(input["company"], "Globex Inc");
        assert_eq!(input["query"], "pricing tiers");
        assert!(!input.contains_key("name"));
    }

    #[test]
    fn test_plain_text_yields_nothing() {
        assert!(extract_input("sounds good, talk soon").is_empty());
    }
}
