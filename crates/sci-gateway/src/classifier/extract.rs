//! Best-effort parameter extraction from free text.
//!
//! Every extractor reports how many parameters were mentioned but could not
//! be parsed; the classifier lowers its confidence accordingly instead of
//! failing the request.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::domain::Vector3;
use crate::utils::TextUtils;

const PROTEIN_ALPHABET: &str = "ACDEFGHIKLMNPQRSTVWY";
const DNA_ALPHABET: &str = "ACGTN";
const MIN_UPPER_SEQUENCE: usize = 10;
const MIN_LOWER_SEQUENCE: usize = 25;
/// Runs at least this long count as sequences with no surrounding keyword.
pub const MIN_BARE_SEQUENCE: usize = 20;
const MAX_FLANK: u32 = 1000;
const MAX_DNA_TOKENS: u32 = 300;

lazy_static! {
    static ref FLANK_BEFORE_RE: Regex = Regex::new(
        r"(?i)(\d+)\s*个?\s*(?:residues?|amino acids?|aa|氨基酸|残基)?\s*(?:to|on|at)?\s*(?:the\s+)?(left|right|n[- ]?termin(?:us|al)|c[- ]?termin(?:us|al))\b"
    ).unwrap();
    static ref LEFT_AFTER_RE: Regex = Regex::new(
        r"(?i)(?:左侧|左边|左端|n-?端|\bn[- ]?termin(?:us|al)\b|\bleft\b)[^0-9\n]{0,16}?(\d+)"
    ).unwrap();
    static ref RIGHT_AFTER_RE: Regex = Regex::new(
        r"(?i)(?:右侧|右边|右端|c-?端|\bc[- ]?termin(?:us|al)\b|\bright\b)[^0-9\n]{0,16}?(\d+)"
    ).unwrap();
    static ref BOTH_SIDES_RE: Regex = Regex::new(
        r"(?i)(?:两侧|两端|\bboth\s+(?:sides|ends|termini)\b)[^0-9\n]{0,16}?(\d+)"
    ).unwrap();
    static ref LEFT_MENTION_RE: Regex = Regex::new(r"(?i)左侧|左边|左端|n-?端|\bn[- ]?termin|\bleft\b").unwrap();
    static ref RIGHT_MENTION_RE: Regex = Regex::new(r"(?i)右侧|右边|右端|c-?端|\bc[- ]?termin|\bright\b").unwrap();

    static ref STRUCTURE_RE: Regex = Regex::new(
        r"(?i)\bstructures?\b|\b3d\b|\bfold(?:ing)?\b|\bcomplex\b|\bmultimer\b|\bpdb\b|结构|折叠|复合物|三维|构象"
    ).unwrap();
    static ref COMPLETION_RE: Regex = Regex::new(
        r"(?i)\bcomplet(?:e|ion)\b|\bextend\b|\bextension\b|\bfill\b|补全|延伸|扩展|填充"
    ).unwrap();

    static ref DNA_TOKENS_DIRECTED_RE: Regex = Regex::new(
        r"(?i)(?:next|another|additional|continue|extend|generate|predict|生成|预测|延伸|续写)[^0-9\n]{0,16}?(\d+)\s*个?\s*(?:bp|nt|bases|nucleotides|tokens|碱基|核苷酸)"
    ).unwrap();
    static ref DNA_TOKENS_RE: Regex = Regex::new(
        r"(?i)(\d+)\s*个?\s*(?:bp|nt|bases|nucleotides|tokens|碱基|核苷酸)"
    ).unwrap();

    static ref BATCH_SIZE_RE: Regex = Regex::new(
        r"(?i)batch[_ ]?size\D{0,6}?(\d+)|(\d+)\s*个?\s*(?:samples?|structures?|candidates?|crystals?|materials?|样本|结构|晶体|材料)"
    ).unwrap();
    static ref NUM_BATCHES_RE: Regex = Regex::new(
        r"(?i)num[_ ]?batches\D{0,6}?(\d+)|(\d+)\s*(?:batches|批)"
    ).unwrap();
    static ref INLINE_JSON_RE: Regex = Regex::new(r"\{[^{}]*\}").unwrap();
    static ref CHEMICAL_SYSTEM_RE: Regex = Regex::new(
        r"(?i:chemical[_ ]system|化学体系|元素体系)\s*[:=为是]?\s*([A-Z][a-z]?(?:-[A-Z][a-z]?)+)"
    ).unwrap();
    static ref SPACE_GROUP_RE: Regex = Regex::new(r"(?i:space[_ ]group|空间群)\D{0,8}?(\d{1,3})").unwrap();

    static ref URL_RE: Regex = Regex::new(r#"https?://[^\s，。；、）)\]"'<>]+"#).unwrap();
    static ref TRAIN_SPEED_RE: Regex = Regex::new(
        r"(?i)(?:train speed|running speed|velocity|车速|行驶速度|运行速度|时速)\D{0,10}?(\d+(?:\.\d+)?)\s*(km/h|kmh|公里每小时|公里/小时|m/s|米每秒)?"
    ).unwrap();
    static ref BARE_KMH_RE: Regex = Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(km/h|kmh|公里每小时|公里/小时)").unwrap();
    static ref CROSSWIND_RE: Regex = Regex::new(
        r"(?i)(?:cross\s?wind|lateral wind|side wind|横风|侧风|wind speed|风速)\D{0,10}?(-?\d+(?:\.\d+)?)\s*(km/h|kmh|m/s)?"
    ).unwrap();
    static ref VERTICAL_WIND_RE: Regex = Regex::new(
        r"(?i)(?:vertical wind|垂直风(?:速)?)\D{0,10}?(-?\d+(?:\.\d+)?)\s*(km/h|kmh|m/s)?"
    ).unwrap();
}

/// Extracted value plus the number of parameters that were mentioned but
/// could not be parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted<T> {
    pub value: T,
    pub unparsed: u32,
}

impl<T> Extracted<T> {
    fn clean(value: T) -> Self {
        Self { value, unparsed: 0 }
    }
}

/// Biological sequences found in the text, in order of appearance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sequences {
    pub proteins: Vec<String>,
    pub dna: Vec<String>,
}

/// Find protein and DNA sequences: maximal ASCII letter runs that are long
/// enough and drawn only from the residue or base alphabet. Uppercase runs
/// of 10+ letters qualify; mixed case needs 25+ to avoid ordinary words.
pub fn sequences(text: &str) -> Sequences {
    let mut found = Sequences::default();
    for (_, run) in TextUtils::ascii_letter_runs(text) {
        let is_upper = run.chars().all(|c| c.is_ascii_uppercase());
        let long_enough = (is_upper && run.len() >= MIN_UPPER_SEQUENCE) || run.len() >= MIN_LOWER_SEQUENCE;
        if !long_enough {
            continue;
        }
        let upper = run.to_ascii_uppercase();
        if upper.chars().all(|c| DNA_ALPHABET.contains(c)) {
            found.dna.push(upper);
        } else if upper.chars().all(|c| PROTEIN_ALPHABET.contains(c)) {
            found.proteins.push(upper);
        }
    }
    found
}

fn parse_bounded(caps: &Captures, group: usize, max: u32) -> Option<Option<u32>> {
    let raw = caps.get(group)?.as_str();
    Some(raw.parse::<u32>().ok().filter(|v| *v <= max))
}

fn first_number(re: &Regex, text: &str, max: u32) -> Option<Option<u32>> {
    re.captures(text).and_then(|caps| {
        (1..caps.len()).find_map(|g| parse_bounded(&caps, g, max))
    })
}

/// Residues to add at the N-terminus (left) and C-terminus (right).
pub fn flank_lengths(text: &str) -> Extracted<(Option<u32>, Option<u32>)> {
    let mut left: Option<Option<u32>> = None;
    let mut right: Option<Option<u32>> = None;

    // "50 residues to the left" style first, the number precedes the side.
    for caps in FLANK_BEFORE_RE.captures_iter(text) {
        let value = parse_bounded(&caps, 1, MAX_FLANK).flatten();
        let side = caps.get(2).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
        if side == "left" || side.starts_with('n') {
            left.get_or_insert(value);
        } else {
            right.get_or_insert(value);
        }
    }
    if left.is_none() {
        left = first_number(&LEFT_AFTER_RE, text, MAX_FLANK);
    }
    if right.is_none() {
        right = first_number(&RIGHT_AFTER_RE, text, MAX_FLANK);
    }
    if let Some(both) = first_number(&BOTH_SIDES_RE, text, MAX_FLANK) {
        left.get_or_insert(both);
        right.get_or_insert(both);
    }

    let mut unparsed = 0;
    let mut resolve = |slot: Option<Option<u32>>, mentioned: bool| match slot {
        Some(Some(v)) => Some(v),
        Some(None) => {
            unparsed += 1;
            None
        }
        None => {
            if mentioned {
                unparsed += 1;
            }
            None
        }
    };
    let left = resolve(left, LEFT_MENTION_RE.is_match(text));
    let right = resolve(right, RIGHT_MENTION_RE.is_match(text));
    Extracted { value: (left, right), unparsed }
}

/// Whether the user asks for a 3D structure rather than a sequence completion.
pub fn wants_structure(text: &str) -> bool {
    STRUCTURE_RE.is_match(text) && !COMPLETION_RE.is_match(text)
}

pub fn wants_completion(text: &str) -> bool {
    COMPLETION_RE.is_match(text)
}

/// Number of bases to generate after a DNA prompt.
pub fn dna_num_tokens(text: &str) -> Extracted<Option<u32>> {
    let found = first_number(&DNA_TOKENS_DIRECTED_RE, text, MAX_DNA_TOKENS)
        .or_else(|| {
            // Otherwise the last length mentioned.
            DNA_TOKENS_RE
                .captures_iter(text)
                .filter_map(|caps| parse_bounded(&caps, 1, MAX_DNA_TOKENS))
                .last()
        });
    match found {
        Some(Some(v)) if v > 0 => Extracted::clean(Some(v)),
        Some(_) => Extracted { value: None, unparsed: 1 },
        None => Extracted::clean(None),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterialsRequest {
    pub batch_size: Option<u32>,
    pub num_batches: Option<u32>,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

struct NumericProperty {
    key: &'static str,
    pattern: Regex,
}

lazy_static! {
    static ref NUMERIC_PROPERTIES: Vec<NumericProperty> = [
        ("dft_mag_density", r"(?i)dft_mag_density|magnetic density|磁密度|磁化密度"),
        ("dft_band_gap", r"(?i)dft_band_gap|band ?gap|带隙"),
        ("ml_bulk_modulus", r"(?i)ml_bulk_modulus|bulk modulus|体积模量|体模量"),
        ("energy_above_hull", r"(?i)energy_above_hull|energy above (?:the )?hull|凸包能"),
    ]
    .into_iter()
    .map(|(key, names)| NumericProperty {
        key,
        pattern: Regex::new(&format!(r"(?:{})\D{{0,12}}?(-?\d+(?:\.\d+)?)", names)).unwrap(),
    })
    .collect();
    static ref PROPERTY_MENTION_RE: Regex = Regex::new(
        r"(?i)dft_mag_density|magnetic density|磁密度|磁化密度|dft_band_gap|band ?gap|带隙|ml_bulk_modulus|bulk modulus|体积模量|体模量|energy_above_hull|energy above (?:the )?hull|凸包能"
    ).unwrap();
}

pub fn materials(text: &str) -> Extracted<MaterialsRequest> {
    let mut request = MaterialsRequest {
        batch_size: first_number(&BATCH_SIZE_RE, text, 1024).flatten().filter(|v| *v > 0),
        num_batches: first_number(&NUM_BATCHES_RE, text, 64).flatten().filter(|v| *v > 0),
        ..Default::default()
    };
    let mut unparsed = 0;

    for property in NUMERIC_PROPERTIES.iter() {
        if let Some(caps) = property.pattern.captures(text) {
            match caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) {
                Some(v) => {
                    request.properties.insert(property.key.to_string(), serde_json::json!(v));
                }
                None => unparsed += 1,
            }
        }
    }
    if PROPERTY_MENTION_RE.is_match(text) && request.properties.is_empty() {
        unparsed += 1;
    }

    if let Some(caps) = CHEMICAL_SYSTEM_RE.captures(text) {
        if let Some(system) = caps.get(1) {
            request
                .properties
                .insert("chemical_system".to_string(), serde_json::json!(system.as_str()));
        }
    }
    if let Some(group) = first_number(&SPACE_GROUP_RE, text, 230).flatten().filter(|v| *v > 0) {
        request.properties.insert("space_group".to_string(), serde_json::json!(group));
    }

    // An inline JSON object wins over anything guessed from prose.
    for m in INLINE_JSON_RE.find_iter(text) {
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(m.as_str()) {
            Ok(map) => request.properties.extend(map),
            Err(_) => unparsed += 1,
        }
    }

    Extracted { value: request, unparsed }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldRequest {
    pub geometry_url: Option<String>,
    pub velocity: Option<Vector3>,
    pub wind: Option<Vector3>,
}

fn to_metres_per_second(value: f64, unit: Option<&str>) -> f64 {
    match unit.map(|u| u.to_lowercase()) {
        Some(u) if u.starts_with("km") || u.starts_with("公里") => value / 3.6,
        _ => value,
    }
}

fn speed(re: &Regex, text: &str) -> Option<Option<f64>> {
    let caps = re.captures(text)?;
    let value = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok());
    Some(value.map(|v| to_metres_per_second(v, caps.get(2).map(|m| m.as_str()))))
}

pub fn field(text: &str) -> Extracted<FieldRequest> {
    let geometry_url = URL_RE
        .find(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']).to_string());
    // Numbers inside the URL must not be read as speeds.
    let prose = URL_RE.replace_all(text, " ");

    let mut unparsed = 0;
    let mut take = |found: Option<Option<f64>>| match found {
        Some(Some(v)) => Some(v),
        Some(None) => {
            unparsed += 1;
            None
        }
        None => None,
    };

    let train = take(speed(&TRAIN_SPEED_RE, &prose)).or_else(|| speed(&BARE_KMH_RE, &prose).flatten());
    let cross = take(speed(&CROSSWIND_RE, &prose));
    let vertical = take(speed(&VERTICAL_WIND_RE, &prose));

    let wind = (cross.is_some() || vertical.is_some())
        .then(|| Vector3::new(0.0, cross.unwrap_or(0.0), vertical.unwrap_or(0.0)));

    Extracted {
        value: FieldRequest {
            geometry_url,
            velocity: train.map(|x| Vector3::new(x, 0.0, 0.0)),
            wind,
        },
        unparsed,
    }
}
