use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use std::str::FromStr;

/// 货币最小单位, 如 minor_units=2 => 0.01
pub fn minor_unit(minor_units: u32) -> BigDecimal {
    BigDecimal::new(1.into(), i64::from(minor_units))
}

/// 四舍五入 (远离零) 到指定小数位
pub fn round_to(value: &BigDecimal, scale: u32) -> BigDecimal {
    let half = BigDecimal::new(5.into(), i64::from(scale) + 1);
    let adjusted = if *value < BigDecimal::zero() {
        value - &half
    } else {
        value + &half
    };
    // with_scale 向零截断
    adjusted.with_scale(i64::from(scale))
}

/// 两个金额是否在一个最小单位容差内
pub fn within_minor_unit(a: &BigDecimal, b: &BigDecimal, minor_units: u32) -> bool {
    (a - b).abs() <= minor_unit(minor_units)
}

/// 解析金额字符串, 容忍千分位逗号和空白
pub fn parse_amount(raw: &str) -> Option<BigDecimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',' && *c != '_')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    BigDecimal::from_str(&cleaned).ok()
}

/// 百分比等展示用浮点, 不参与金额计算
pub fn to_f64(value: &BigDecimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
