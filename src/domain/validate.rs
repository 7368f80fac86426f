//! Field checks for intake forms. Run client-side before any write.

use crate::errors::FieldError;

/// Push a "required" error when `value` is blank.
pub fn required(errors: &mut Vec<FieldError>, field: &str, value: &str) {
    if value.trim().is_empty() {
        errors.push(FieldError::new(field, "required"));
    }
}

fn digits(value: &str) -> Vec<u32> {
    value.chars().filter_map(|c| c.to_digit(10)).collect()
}

/// Only digits and the usual punctuation (`.`, `-`, `/`, spaces).
fn is_document_text(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '/' | ' '))
}

fn all_same(d: &[u32]) -> bool {
    d.windows(2).all(|w| w[0] == w[1])
}

fn weighted_sum(d: &[u32], weights: &[u32]) -> u32 {
    d.iter().zip(weights).map(|(a, b)| a * b).sum()
}

/// CPF: 11 digits, two mod-11 check digits.
pub fn is_valid_cpf(value: &str) -> bool {
    let d = digits(value);
    if !is_document_text(value) || d.len() != 11 || all_same(&d) {
        return false;
    }
    let check = |len: usize| {
        let weights: Vec<u32> = (2..=len as u32 + 1).rev().collect();
        (weighted_sum(&d[..len], &weights) * 10) % 11 % 10
    };
    check(9) == d[9] && check(10) == d[10]
}

/// CNPJ: 14 digits, two mod-11 check digits with cycling 2..9 weights.
pub fn is_valid_cnpj(value: &str) -> bool {
    let d = digits(value);
    if !is_document_text(value) || d.len() != 14 || all_same(&d) {
        return false;
    }
    let check = |len: usize| {
        let weights: Vec<u32> = (0..len as u32).rev().map(|i| i % 8 + 2).collect();
        let rest = weighted_sum(&d[..len], &weights) % 11;
        if rest < 2 { 0 } else { 11 - rest }
    };
    check(12) == d[12] && check(13) == d[13]
}

pub fn is_valid_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !value.chars().any(char::is_whitespace)
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
}

/// Brazilian phone: 10 or 11 digits with area code, optional `+55`.
pub fn is_valid_phone(value: &str) -> bool {
    let d = digits(value);
    let national = match d.len() {
        12 | 13 if d[..2] == [5, 5] => &d[2..],
        _ => &d[..],
    };
    matches!(national.len(), 10 | 11) && national[0] != 0
}

/// `52998224725` → `529.982.247-25`; `11222333000181` → `11.222.333/0001-81`.
/// Anything else is returned unchanged.
pub fn format_document(value: &str) -> String {
    let d: String = value.chars().filter(char::is_ascii_digit).collect();
    match d.len() {
        11 => format!("{}.{}.{}-{}", &d[..3], &d[3..6], &d[6..9], &d[9..]),
        14 => format!(
            "{}.{}.{}/{}-{}",
            &d[..2],
            &d[2..5],
            &d[5..8],
            &d[8..12],
            &d[12..]
        ),
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpf() {
        assert!(is_valid_cpf("529.982.247-25"));
        assert!(is_valid_cpf("52998224725"));
        assert!(!is_valid_cpf("529.982.247-26"));
        assert!(!is_valid_cpf("111.111.111-11"));
        assert!(!is_valid_cpf("5299822472"));
        assert!(!is_valid_cpf("529x982x247x25"));
    }

    #[test]
    fn test_cnpj() {
        assert!(is_valid_cnpj("11.222.333/0001-81"));
        assert!(is_valid_cnpj("11222333000181"));
        assert!(!is_valid_cnpj("11.222.333/0001-82"));
        assert!(!is_valid_cnpj("00.000.000/0000-00"));
    }

    #[test]
    fn test_email() {
        assert!(is_valid_email("ana@banco.com.br"));
        assert!(!is_valid_email("ana@banco"));
        assert!(!is_valid_email("@banco.com"));
        assert!(!is_valid_email("ana @banco.com"));
        assert!(!is_valid_email("ana@@banco.com"));
        assert!(!is_valid_email("ana@banco..com"));
    }

    #[test]
    fn test_phone() {
        assert!(is_valid_phone("(11) 98765-4321"));
        assert!(is_valid_phone("+55 11 3456-7890"));
        assert!(!is_valid_phone("98765-4321"));
        assert!(!is_valid_phone("(01) 3456-7890"));
    }

    #[test]
    fn test_required() {
        let mut errors = Vec::new();
        required(&mut errors, "name", "  ");
        required(&mut errors, "title", "ok");
        assert_eq!(errors, vec![FieldError::new("name", "required")]);
    }

    #[test]
    fn test_format_document() {
        assert_eq!(format_document("52998224725"), "529.982.247-25");
        assert_eq!(format_document("11222333000181"), "11.222.333/0001-81");
        assert_eq!(format_document("123"), "123");
    }
}
