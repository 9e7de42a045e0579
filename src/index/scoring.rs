//! TF-IDF relevance scoring over lowercase alphanumeric terms

use std::collections::{HashMap, HashSet};

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Score every document against the query; output is parallel to `docs`
pub fn rank_texts(query: &str, docs: &[&str]) -> Vec<f64> {
    let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
    if query_terms.is_empty() || docs.is_empty() {
        return vec![0.0; docs.len()];
    }

    let tokenized: Vec<Vec<String>> = docs.iter().map(|d| tokenize(d)).collect();

    let mut document_frequency: HashMap<&str, usize> = HashMap::new();
    for tokens in &tokenized {
        let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        for term in unique {
            if query_terms.contains(term) {
                *document_frequency.entry(term).or_insert(0) += 1;
            }
        }
    }

    let n = docs.len() as f64;
    tokenized
        .iter()
        .map(|tokens| {
            if tokens.is_empty() {
                return 0.0;
            }
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for token in tokens {
                if query_terms.contains(token.as_str()) {
                    *counts.entry(token.as_str()).or_insert(0) += 1;
                }
            }
            counts
                .into_iter()
                .map(|(term, count)| {
                    let df = document_frequency.get(term).copied().unwrap_or(0) as f64;
                    let idf = ((n + 1.0) / (df + 1.0)).ln() + 1.0;
                    (count as f64 / tokens.len() as f64) * idf
                })
                .sum()
        })
        .collect()
}

/// Indices of the `k` best-scoring documents, best first
pub fn top_k(query: &str, docs: &[&str], k: usize) -> Vec<usize> {
    let scores = rank_texts(query, docs);
    let mut order: Vec<usize> = (0..docs.len()).filter(|i| scores[*i] > 0.0).collect();
    order.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]));
    order.truncate(k);
    order
}
