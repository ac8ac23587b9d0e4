use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

const MOL2_ATOM_SECTION: &str = "@<TRIPOS>ATOM";
const MOL2_SECTION_PREFIX: &str = "@<TRIPOS>";
const END_MODEL: &str = "ENDMDL";

static VINA_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^REMARK VINA RESULT:\s+(-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)")
        .unwrap_or_else(|err| panic!("invalid VINA RESULT pattern: {err}"))
});

/// Renames each `@<TRIPOS>ATOM` entry after its element with a per-element
/// counter (`C1`, `C2`, `O1`, `Cl1`).
pub fn renumber_mol2_atoms(content: &str) -> Result<String, String> {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let start = lines
        .iter()
        .position(|line| line.trim_end() == MOL2_ATOM_SECTION)
        .ok_or_else(|| "no @<TRIPOS>ATOM section".to_string())?;

    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut out = String::with_capacity(content.len());
    for line in &lines[..=start] {
        out.push_str(line);
    }
    let mut in_atoms = true;
    for line in &lines[start + 1..] {
        if line.starts_with(MOL2_SECTION_PREFIX) {
            in_atoms = false;
        }
        if !in_atoms {
            out.push_str(line);
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        let element = element_symbol(&slice(&chars, 8, 10));
        let count = counts.entry(element.clone()).or_insert(0);
        *count += 1;
        out.push_str(&slice(&chars, 0, 8));
        out.push_str(&format!("{:<4}", format!("{element}{count}")));
        out.push_str(&slice(&chars, 11, chars.len()));
    }
    Ok(out)
}

fn slice(chars: &[char], start: usize, end: usize) -> String {
    let end = end.min(chars.len());
    if start >= end {
        return String::new();
    }
    chars[start..end].iter().collect()
}

fn element_symbol(raw: &str) -> String {
    let raw = raw.trim();
    let mut chars = raw.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some(first), Some(second), None) if !second.is_ascii_digit() => {
            format!("{}{}", first.to_ascii_uppercase(), second.to_ascii_lowercase())
        }
        _ => raw.to_string(),
    }
}

pub fn parse_affinity(content: &str) -> Result<f64, String> {
    content
        .lines()
        .find_map(|line| VINA_RESULT.captures(line.trim_start()))
        .ok_or_else(|| "no REMARK VINA RESULT line".to_string())?
        .get(1)
        .ok_or_else(|| "VINA RESULT without a value".to_string())?
        .as_str()
        .parse::<f64>()
        .map_err(|err| format!("invalid affinity: {err}"))
}

pub fn first_model(content: &str) -> Result<&str, String> {
    let end = content
        .find(END_MODEL)
        .ok_or_else(|| "no ENDMDL record".to_string())?;
    Ok(&content[..end + END_MODEL.len()])
}

pub fn assemble_complex(receptor_pdb: &str, ligand_pdb: &str) -> Result<String, String> {
    let receptor: Vec<&str> = receptor_pdb
        .lines()
        .filter(|line| line.starts_with("ATOM"))
        .collect();
    if receptor.is_empty() {
        return Err("receptor has no ATOM records".to_string());
    }
    let ligand: Vec<String> = ligand_pdb
        .lines()
        .filter(|line| line.starts_with("ATOM") || line.starts_with("HETATM"))
        .map(|line| match line.strip_prefix("ATOM  ") {
            Some(rest) => format!("HETATM{rest}"),
            None => line.to_string(),
        })
        .collect();
    if ligand.is_empty() {
        return Err("ligand has no atom records".to_string());
    }

    let mut out = receptor.join("\n");
    out.push('\n');
    for line in ligand {
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}
