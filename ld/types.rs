// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use std::cmp::Ordering;
use std::fmt;

/// Identity of one variant. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantInformation {
    pub id: String,
    pub alias: Option<String>,
    pub contig: String,
    pub position: u32,
    pub alleles: Vec<String>,
}

impl VariantInformation {
    /// Builds a variant, synthesising `contig_position_allele1_allele2...` when the
    /// container record carries no id. An empty alias is treated as absent.
    pub fn new(
        id: String,
        alias: String,
        contig: String,
        position: u32,
        alleles: Vec<String>,
    ) -> Self {
        let id = if id.is_empty() {
            synthetic_id(&contig, position, &alleles)
        } else {
            id
        };
        let alias = (!alias.is_empty()).then_some(alias);
        Self {
            id,
            alias,
            contig,
            position,
            alleles,
        }
    }

    /// The human-readable label, falling back to the id.
    pub fn display_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.id)
    }

    pub fn reference_allele(&self) -> Option<&str> {
        self.alleles.first().map(String::as_str)
    }
}

impl fmt::Display for VariantInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{} {})",
            self.display_alias(),
            self.contig,
            self.position,
            self.alleles.join("/")
        )
    }
}

fn synthetic_id(contig: &str, position: u32, alleles: &[String]) -> String {
    let mut id = format!("{contig}_{position}");
    for allele in alleles {
        id.push('_');
        id.push_str(allele);
    }
    id
}

/// One decoded (partner ordinal, r²) pair of an LD block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LdPartner {
    pub ordinal: u32,
    pub r2: f64,
}

impl LdPartner {
    /// Encoded size of one pair inside a block payload.
    pub const ENCODED_LEN: usize = 4 + 8;
}

/// Natural ordering of contig names, so that `2` sorts before `10`.
pub fn compare_contigs(left: &str, right: &str) -> Ordering {
    natord::compare(left, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_id_is_synthesised_from_locus() {
        let variant = VariantInformation::new(
            String::new(),
            String::new(),
            "7".to_string(),
            1_234,
            vec!["A".to_string(), "G".to_string()],
        );
        assert_eq!(variant.id, "7_1234_A_G");
        assert_eq!(variant.alias, None);
        assert_eq!(variant.display_alias(), "7_1234_A_G");
    }

    #[test]
    fn alias_is_preferred_for_display() {
        let variant = VariantInformation::new(
            "7:1234:A:G".to_string(),
            "rs99".to_string(),
            "7".to_string(),
            1_234,
            vec!["A".to_string(), "G".to_string()],
        );
        assert_eq!(variant.display_alias(), "rs99");
        assert_eq!(variant.reference_allele(), Some("A"));
        assert_eq!(variant.to_string(), "rs99 (7:1234 A/G)");
    }

    #[test]
    fn contigs_sort_naturally() {
        let mut contigs = vec!["10", "2", "X", "1"];
        contigs.sort_by(|a, b| compare_contigs(a, b));
        assert_eq!(contigs, vec!["1", "2", "10", "X"]);
    }
}
