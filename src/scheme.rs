//! 建筑方案抽取：从工具输出文本中解析方案参数（边界适配器，不参与主循环）
//!
//! extract_schemes 是纯函数：截取文本中第一个 `{`/`[` 到最后一个 `}`/`]` 之间的 JSON，
//! 对象得到一条记录，数组每个对象元素一条；无法解析时返回空，不报错。
//! SchemeBook 为记录分配递增 id（当前最大 id + 1）、颜色与几何尺寸。

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

/// 方案颜色表，按 id 取模
pub const SCHEME_COLORS: [&str; 10] = [
    "#ff4040", "#40ff40", "#4040ff", "#ffff40", "#ff40ff", "#40ffff", "#ff8040", "#40ff80",
    "#8040ff", "#ff4080",
];

/// 每层层高（米）
const FLOOR_HEIGHT: f64 = 3.0;

/// 参数值：数值或原始文本
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    fn text(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }

    /// 文本去掉 `m` 单位后解析，失败为 1.0
    pub fn as_f64(&self) -> f64 {
        match self {
            ParamValue::Int(i) => *i as f64,
            ParamValue::Float(f) => *f,
            ParamValue::Text(s) => s.replace('m', "").trim().parse().unwrap_or(1.0),
        }
    }

    /// 文本只保留数字与小数点后解析并截断，失败为 1
    pub fn as_i64(&self) -> i64 {
        match self {
            ParamValue::Int(i) => *i,
            ParamValue::Float(f) => *f as i64,
            ParamValue::Text(s) => numeric_chars(s).parse::<f64>().map(|f| f as i64).unwrap_or(1),
        }
    }
}

fn non_numeric() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^0-9.]").unwrap())
}

fn numeric_chars(s: &str) -> String {
    non_numeric().replace_all(s, "").into_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemeParameters {
    pub grid_spacing_x: ParamValue,
    pub grid_spacing_y: ParamValue,
    pub extents_x: ParamValue,
    pub extents_y: ParamValue,
    pub no_of_floors: ParamValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemeEvaluations {
    pub steel_tonnage: ParamValue,
    pub column_size: ParamValue,
    pub structural_depth: ParamValue,
    pub concrete_tonnage: ParamValue,
    pub total_emissions: ParamValue,
}

/// 一条抽取结果（尚未分配 id）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemeRecord {
    pub parameters: SchemeParameters,
    pub evaluations: Option<SchemeEvaluations>,
}

/// 带 id、颜色与几何尺寸的方案
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scheme {
    pub id: u32,
    pub parameters: SchemeParameters,
    pub evaluations: Option<SchemeEvaluations>,
    pub width: f64,
    pub depth: f64,
    pub height: f64,
    pub color: String,
}

/// 参数的别名列表
fn aliases(key: &str) -> &'static [&'static str] {
    match key {
        "extents_x" => &["width", "building_width", "x_extent", "x_dimension"],
        "extents_y" => &["depth", "building_depth", "y_extent", "y_dimension"],
        "grid_spacing_x" => &["x_grid", "grid_x", "column_spacing_x"],
        "grid_spacing_y" => &["y_grid", "grid_y", "column_spacing_y"],
        "no_of_floors" => &["floors", "number_of_floors", "stories", "storeys"],
        _ => &[],
    }
}

/// 按 键名 -> 别名 -> 忽略大小写 的顺序查找，空值与缺失取默认值
fn extract_value(data: &Map<String, Value>, key: &str, default: ParamValue) -> ParamValue {
    let found = data
        .get(key)
        .or_else(|| aliases(key).iter().find_map(|alt| data.get(*alt)))
        .or_else(|| {
            data.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        });

    match found {
        None | Some(Value::Null) => default,
        Some(Value::String(s)) if s.trim().is_empty() => default,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => ParamValue::Int(i),
            None => n.as_f64().map(ParamValue::Float).unwrap_or(default),
        },
        Some(Value::String(s)) => {
            let clean = numeric_chars(s);
            if !clean.is_empty() && clean.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(i) = clean.parse() {
                    return ParamValue::Int(i);
                }
            }
            clean
                .parse::<f64>()
                .map(ParamValue::Float)
                .unwrap_or_else(|_| ParamValue::Text(s.clone()))
        }
        Some(other) => ParamValue::Text(other.to_string()),
    }
}

fn record_from(data: &Map<String, Value>) -> SchemeRecord {
    let parameters = SchemeParameters {
        grid_spacing_x: extract_value(data, "grid_spacing_x", ParamValue::Int(6)),
        grid_spacing_y: extract_value(data, "grid_spacing_y", ParamValue::Int(7)),
        extents_x: extract_value(data, "extents_x", ParamValue::Int(30)),
        extents_y: extract_value(data, "extents_y", ParamValue::Int(24)),
        no_of_floors: extract_value(data, "no_of_floors", ParamValue::Int(3)),
    };

    let has_evaluations = ["steel_tonnage", "column_size", "structural_depth"]
        .iter()
        .any(|k| data.contains_key(*k));
    let evaluations = has_evaluations.then(|| {
        let unknown = || ParamValue::text("unknown");
        SchemeEvaluations {
            steel_tonnage: extract_value(data, "steel_tonnage", unknown()),
            column_size: extract_value(data, "column_size", unknown()),
            structural_depth: extract_value(data, "structural_depth", unknown()),
            concrete_tonnage: extract_value(data, "concrete_tonnage", unknown()),
            total_emissions: extract_value(data, "total_emissions", unknown()),
        }
    });

    SchemeRecord {
        parameters,
        evaluations,
    }
}

/// 从自由文本中抽取方案记录
pub fn extract_schemes(raw: &str) -> Vec<SchemeRecord> {
    let Some(start) = raw.find(['{', '[']) else {
        return Vec::new();
    };
    let Some(end) = raw.rfind(['}', ']']) else {
        return Vec::new();
    };
    if end <= start {
        return Vec::new();
    }

    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(Value::Object(obj)) => vec![record_from(&obj)],
        Ok(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_object)
            .map(record_from)
            .collect(),
        Ok(_) => Vec::new(),
        Err(e) => {
            tracing::debug!(error = %e, "no scheme JSON in tool output");
            Vec::new()
        }
    }
}

/// 方案集合：分配 id 与展示属性
#[derive(Debug, Default, Clone)]
pub struct SchemeBook {
    schemes: Vec<Scheme>,
}

impl SchemeBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u32 {
        self.schemes.iter().map(|s| s.id).max().unwrap_or(0) + 1
    }

    pub fn add(&mut self, record: SchemeRecord) -> &Scheme {
        let id = self.next_id();
        let width = record.parameters.extents_x.as_f64();
        let depth = record.parameters.extents_y.as_f64();
        let floors = record.parameters.no_of_floors.as_i64();
        let scheme = Scheme {
            id,
            width,
            depth,
            height: floors as f64 * FLOOR_HEIGHT,
            color: SCHEME_COLORS[id as usize % SCHEME_COLORS.len()].to_string(),
            parameters: record.parameters,
            evaluations: record.evaluations,
        };
        tracing::debug!(id, width, depth, height = scheme.height, "scheme added");
        self.schemes.push(scheme);
        &self.schemes[self.schemes.len() - 1]
    }

    /// 抽取并加入文本中的全部方案，返回新增数量
    pub fn add_from_text(&mut self, raw: &str) -> usize {
        let records = extract_schemes(raw);
        let n = records.len();
        for r in records {
            self.add(r);
        }
        n
    }

    pub fn schemes(&self) -> &[Scheme] {
        &self.schemes
    }

    pub fn get(&self, id: u32) -> Option<&Scheme> {
        self.schemes.iter().find(|s| s.id == id)
    }

    pub fn clear(&mut self) {
        self.schemes.clear();
    }
}
