use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::{AliasCategory, AttributedTerm, Identity, IdentityKind, Occurrence, Provenance, SourceId};
use crate::registry::Registry;
use crate::source::SourceRecord;

const FIRST_NAMES: [&str; 12] = [
    "John", "Mary", "Robert", "Linda", "Michael", "Susan", "David", "Karen", "James", "Nancy", "Thomas", "Helen",
];
const LAST_NAMES: [&str; 12] = [
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Miller", "Davis", "Wilson", "Anderson", "Taylor", "Moore",
    "Martin",
];

fn sighting(value: &str, source: SourceId, row: u64, field: &str) -> AttributedTerm {
    let key = format!("{}-{:06}", source, row);
    AttributedTerm::new(value, Provenance::new(source, Occurrence::new(row, key, field)))
}

/// A distinct person name for slot `i`.
pub fn person_name(rng: &mut StdRng, i: usize) -> String {
    let first = FIRST_NAMES[rng.random_range(0..FIRST_NAMES.len())];
    let last = LAST_NAMES[rng.random_range(0..LAST_NAMES.len())];
    format!("{} {} {:05}", first, last, i)
}

/// Drop one letter of the first token, keeping the rest intact.
pub fn misspell(rng: &mut StdRng, name: &str) -> String {
    let mut tokens: Vec<String> = name.split_whitespace().map(str::to_string).collect();
    if let Some(first) = tokens.first_mut() {
        if first.chars().count() > 2 {
            let drop = rng.random_range(1..first.chars().count());
            *first = first
                .chars()
                .enumerate()
                .filter(|(idx, _)| *idx != drop)
                .map(|(_, ch)| ch)
                .collect();
        }
    }
    tokens.join(" ")
}

/// Registry of `count` people; roughly `variant_probability` of them carry a
/// misspelled homonym.
pub fn generate_registry(count: usize, variant_probability: f64, seed: u64) -> Registry {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut registry = Registry::new();
    for i in 0..count {
        let name = person_name(&mut rng, i);
        let mut identity = Identity::from_primary(IdentityKind::Person, sighting(&name, SourceId::SourceA, i as u64, "name"));
        if rng.random_bool(variant_probability) {
            let variant = misspell(&mut rng, &name);
            let added = identity
                .aliases_mut()
                .add(sighting(&variant, SourceId::SourceB, i as u64, "owner_name"), AliasCategory::Homonyms);
            if let Err(err) = added {
                tracing::debug!(name = %name, variant = %variant, error = %err, "generated variant rejected; skipped");
            }
        }
        if registry.add(identity).is_err() {
            tracing::debug!(name = %name, "generated name collided; skipped");
        }
    }
    registry
}

/// Source records named after people; `repeat_probability` of them reuse an
/// earlier name, the rest are fresh. Natural keys are small fire numbers, so
/// some repeat across records.
pub fn generate_records(count: usize, repeat_probability: f64, seed: u64) -> Vec<SourceRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut names: Vec<String> = Vec::with_capacity(count);
    let mut records = Vec::with_capacity(count);
    for i in 0..count {
        let name = if !names.is_empty() && rng.random_bool(repeat_probability) {
            names[rng.random_range(0..names.len())].clone()
        } else {
            let name = person_name(&mut rng, i);
            names.push(name.clone());
            name
        };
        let source = if rng.random_bool(0.5) {
            SourceId::SourceA
        } else {
            SourceId::SourceB
        };
        let fire_number = rng.random_range(1..=(count as u64 / 2).max(1));
        records.push(
            SourceRecord::new(source, i as u64, format!("{}-{:06}", source, i))
                .with_natural_key(fire_number.to_string())
                .with_field("name", name),
        );
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_registry_is_deterministic_and_clean() {
        let a = generate_registry(50, 0.5, 7);
        let b = generate_registry(50, 0.5, 7);
        assert_eq!(a.len(), 50);
        assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
        assert!(a.verify().is_empty());
        assert!(a.shared_variants().is_empty());
        // Every identity drew a variant, and every variant was kept.
        let all = generate_registry(50, 1.0, 7);
        assert_eq!(all.alias_count(), 100);
    }

    #[test]
    fn test_misspell_drops_one_letter() {
        let mut rng = StdRng::seed_from_u64(1);
        let variant = misspell(&mut rng, "Michael Brown 00001");
        assert_eq!(variant.len(), "Michael Brown 00001".len() - 1);
        assert!(variant.ends_with(" Brown 00001"));
    }
}
