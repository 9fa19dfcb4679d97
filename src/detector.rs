use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;

use crate::types::Side;

/// One matched fragment of a candidate signal message.
#[derive(Debug, Clone)]
pub enum Fragment {
    Symbol(String),
    Direction(Side),
    Entry { low: Decimal, high: Option<Decimal> },
    Targets(Vec<Decimal>),
    Stop(Decimal),
    Leverage(Decimal),
}

/// Everything the three-stage pipeline found, plus the running score. Carried even on
/// rejection so telemetry can explain the decision field-by-field.
#[derive(Debug, Default)]
pub struct DetectionReport {
    pub symbol: Option<String>,
    pub direction: Option<Side>,
    pub entry_low: Option<Decimal>,
    pub entry_high: Option<Decimal>,
    pub targets: Vec<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub leverage: Option<Decimal>,
    pub score: i32,
    pub reason: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct ParsedSignal {
    pub symbol: String,
    pub side: Side,
    pub entry_low: Decimal,
    pub entry_high: Option<Decimal>,
    pub entry_mid: Decimal,
    pub targets: Vec<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub leverage: Option<Decimal>,
}

static EXCLUSION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)all\s+(entry|take[- ]?profit)?\s*targets?\s+achieved",
        r"(?i)target\s+\d+\s*✅",
        r"(?i)tp\d*\s*✅",
        r"(?i)profit:\s*[\d.]+%.*period:",
        r"(?i)achieved\s*(😎|✅|✔)",
        r"(?i)^(news|update|announcement|important|notice|maintenance)\s*:",
        r"(?i)system update|bug fix",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static FIRST_PERSON_INTENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(I've|I am|I'm|I want|I decided)\b").unwrap());

static TRADING_KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)entry|target|tp|stop|sl|leverage").unwrap());

static SYMBOL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"#([A-Z]{2,10})(?:USDT|/USDT)?\b",
        r"\b([A-Z]{2,10})USDT\b",
        r"\b([A-Z]{2,10})/USDT\b",
        r"\b([A-Z]{2,10})\(USDT\)",
        r"(?i)(?:Symbol|COIN NAME)\s*:\s*([A-Za-z]{2,10})\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static DIRECTION_PATTERNS: Lazy<Vec<(Regex, Side)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"(?i)\bLONG\b|\bBUY\b|🟢\s*LONG|📈\s*LONG").unwrap(), Side::Long),
        (Regex::new(r"(?i)\bSHORT\b|\bSELL\b|🔴\s*SHORT|📉\s*SHORT").unwrap(), Side::Short),
        (Regex::new(r"(?i)(Trade|Signal)\s*Type\s*[:\-]\s*Long|Opening\s*LONG|LONG\s*SETUP|#LONG").unwrap(), Side::Long),
        (Regex::new(r"(?i)(Trade|Signal)\s*Type\s*[:\-]\s*Short|Opening\s*SHORT|SHORT\s*SETUP|#SHORT").unwrap(), Side::Short),
    ]
});

static ENTRY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:Entry\s*(?:zone|price)?|Entries|ENTRY PRICE)\s*[:\-]?\s*\(?\$?([\d.]+)\s*(?:-|to)?\s*\$?([\d.]*)\)?").unwrap()
});

static TARGETS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:Target\s*\d*|Targets|Take[- ]?Profit|TP\d*)\s*[:\-]?\s*\$?([\d.]+)").unwrap()
});

static STOP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:Stop[- ]?Loss|Stoploss|\bSL\b|\bSTOP\b)\s*[:\-]?\s*\$?([\d.]+)").unwrap()
});

static LEVERAGE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)leverage\s*[:\-]?\s*(?:x)?([\d.]+)(?:x)?").unwrap());

fn find_symbol(text: &str) -> Option<String> {
    for re in SYMBOL_PATTERNS.iter() {
        if let Some(caps) = re.captures(text) {
            let base = caps.get(1)?.as_str().to_uppercase();
            if base.len() >= 2 && base.len() <= 10 {
                return Some(format!("{}USDT", base));
            }
        }
    }
    None
}

fn find_direction(text: &str) -> Option<Side> {
    DIRECTION_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, side)| *side)
}

fn parse_price(s: &str) -> Option<Decimal> {
    let cleaned = s.trim().trim_start_matches('$');
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

fn find_entry(text: &str) -> Option<(Decimal, Option<Decimal>)> {
    let caps = ENTRY_PATTERN.captures(text)?;
    let low = parse_price(caps.get(1)?.as_str())?;
    let high = caps.get(2).and_then(|m| parse_price(m.as_str()));
    Some((low, high))
}

fn find_targets(text: &str) -> Vec<Decimal> {
    TARGETS_PATTERN
        .captures_iter(text)
        .filter_map(|c| parse_price(c.get(1)?.as_str()))
        .collect()
}

fn find_stop(text: &str) -> Option<Decimal> {
    STOP_PATTERN.captures(text).and_then(|c| parse_price(c.get(1)?.as_str()))
}

fn find_leverage(text: &str) -> Option<Decimal> {
    LEVERAGE_PATTERN.captures(text).and_then(|c| parse_price(c.get(1)?.as_str()))
}

fn count_numeric_tokens(text: &str) -> usize {
    static NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$?\d+\.?\d*").unwrap());
    NUMERIC.find_iter(text).count()
}

/// Run the three-stage detection pipeline against a raw chat message.
pub fn detect(text: &str) -> DetectionReport {
    let mut report = DetectionReport::default();
    let trimmed = text.trim();

    // Stage 1 — hard exclusion.
    if trimmed.len() < 10 {
        report.reason = Some("too_short");
        return report;
    }
    for re in EXCLUSION_PATTERNS.iter() {
        if re.is_match(trimmed) {
            report.score -= 10;
            report.reason = Some("excluded:pattern");
            return report;
        }
    }
    if FIRST_PERSON_INTENT.is_match(trimmed) && !TRADING_KEYWORD.is_match(trimmed) {
        report.reason = Some("excluded:first_person_intent");
        return report;
    }

    // Stage 2 — component extraction.
    report.symbol = find_symbol(trimmed);
    report.direction = find_direction(trimmed);
    if let Some((low, high)) = find_entry(trimmed) {
        report.entry_low = Some(low);
        report.entry_high = high;
    }
    report.targets = find_targets(trimmed);
    report.stop_loss = find_stop(trimmed);
    report.leverage = find_leverage(trimmed);

    if report.symbol.is_none() {
        report.reason = Some("missing_symbol");
        return report;
    }
    if report.direction.is_none() {
        report.reason = Some("missing_direction");
        return report;
    }
    let has_trading_data =
        report.entry_low.is_some() || !report.targets.is_empty() || report.stop_loss.is_some();
    if !has_trading_data {
        report.reason = Some("missing_trading_data");
        return report;
    }

    // Stage 3 — confidence scoring.
    let mut score = 4; // symbol present
    score += 3; // direction present
    if report.entry_low.is_some() {
        score += 3;
    }
    if !report.targets.is_empty() {
        score += 2;
    }
    if report.stop_loss.is_some() {
        score += 2;
    }
    if report.leverage.is_some() {
        score += 1;
    }
    if report.targets.len() >= 2 {
        score += 1;
    }
    if count_numeric_tokens(trimmed) >= 3 {
        score += 1;
    }
    report.score = score;

    if score < 3 {
        report.reason = Some("below_confidence");
    }
    report
}

/// Normalize a detection report with score ≥3 into a persistable signal.
pub fn to_parsed_signal(report: &DetectionReport) -> Option<ParsedSignal> {
    if report.reason.is_some() {
        return None;
    }
    let symbol = report.symbol.clone()?;
    let side = report.direction?;
    let entry_low = report.entry_low.unwrap_or(Decimal::ZERO);
    let entry_high = report.entry_high;
    let entry_mid = match entry_high {
        Some(high) if !high.is_zero() => (entry_low + high) / Decimal::TWO,
        _ => entry_low,
    };
    let mut targets = report.targets.clone();
    match side {
        Side::Long => targets.sort(),
        Side::Short => targets.sort_by(|a, b| b.cmp(a)),
    }

    Some(ParsedSignal {
        symbol,
        side,
        entry_low,
        entry_high,
        entry_mid,
        targets,
        stop_loss: report.stop_loss,
        leverage: report.leverage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_signal() {
        let text = "#GUN/USDT\nSignal Type: Long\nEntry: 0.0500 - 0.0520\nTargets:\nTarget 1: 0.0550\nTarget 2: 0.0600\nStop Loss: 0.0480\nLeverage: 10x";
        let report = detect(text);
        assert!(report.reason.is_none(), "rejected: {:?}", report.reason);
        assert!(report.score >= 8);
        let parsed = to_parsed_signal(&report).unwrap();
        assert_eq!(parsed.symbol, "GUNUSDT");
        assert_eq!(parsed.side, Side::Long);
        assert_eq!(parsed.targets.len(), 2);
    }

    #[test]
    fn short_targets_sort_descending() {
        let text = "#ABC/USDT\nSignal Type: Short\nEntry: 1.00 - 1.02\nTargets:\nTarget 1: 0.80\nTarget 2: 0.90\nStop Loss: 1.10\nLeverage: 10x";
        let report = detect(text);
        assert!(report.reason.is_none(), "rejected: {:?}", report.reason);
        let parsed = to_parsed_signal(&report).unwrap();
        assert_eq!(parsed.side, Side::Short);
        assert_eq!(parsed.targets, vec![Decimal::new(90, 2), Decimal::new(80, 2)]);
    }

    #[test]
    fn missing_stop_loss_still_detected() {
        let text = "#FHE LONG Entry: 1.20 Target 1: 1.35 Target 2: 1.50";
        let report = detect(text);
        assert!(report.reason.is_none());
        assert!(report.stop_loss.is_none());
    }

    #[test]
    fn rejects_target_achieved_update() {
        let text = "🎉 All entry targets achieved on #PARTI/USDT! Great trade everyone.";
        let report = detect(text);
        assert_eq!(report.reason, Some("excluded:pattern"));
    }

    #[test]
    fn rejects_too_short() {
        let report = detect("hey");
        assert_eq!(report.reason, Some("too_short"));
    }

    #[test]
    fn first_person_without_trading_keyword_excluded() {
        let report = detect("I've been thinking about trading lately honestly");
        assert_eq!(report.reason, Some("excluded:first_person_intent"));
    }

    #[test]
    fn first_person_with_trading_keyword_survives_stage1() {
        let text = "I decided to enter #BTCUSDT LONG Entry: 60000 Stop Loss: 58000";
        let report = detect(text);
        assert_ne!(report.reason, Some("excluded:first_person_intent"));
    }
}
