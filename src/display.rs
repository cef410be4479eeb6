use crate::Error;
use crate::qty::Qty;
use crate::recommend::{Advice, Amount, Estimate, RecommendationRow};
use crate::report::Report;
use chrono::prelude::*;
use itertools::Itertools;
#[cfg(feature = "prettytable")]
use prettytable::{Cell, Row, Table, format, row};
#[cfg(not(feature = "prettytable"))]
use tracing::warn;

pub const UNDETERMINED: &str = "could not determine";
pub const ABSENT: &str = "<none>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Cores,
    Bytes,
}

impl Unit {
    pub fn format(self, value: f64) -> String {
        let qty = match self {
            Unit::Cores => Qty::cores(value),
            Unit::Bytes => Qty::bytes(value),
        };
        qty.adjust_scale().to_string()
    }
}

pub fn format_amount(amount: Amount, unit: Unit) -> String {
    match amount {
        Amount::Value(v) => unit.format(v),
        Amount::Absent => ABSENT.to_string(),
        Amount::Undetermined => UNDETERMINED.to_string(),
    }
}

/// `recommended (current)`, like `300m (500m)`
pub fn format_estimate(estimate: &Estimate, unit: Unit) -> String {
    format!(
        "{} ({})",
        format_amount(estimate.recommended, unit),
        format_amount(estimate.current, unit)
    )
}

fn advices(row: &RecommendationRow) -> String {
    [
        ("cpu request", &row.request_cpu),
        ("memory request", &row.request_memory),
        ("cpu limit", &row.limit_cpu),
        ("memory limit", &row.limit_memory),
    ]
    .into_iter()
    .filter(|(_, e)| e.advice != Advice::Keep)
    .map(|(name, e)| format!("{} {}", e.advice, name))
    .join(", ")
}

pub fn format_totals(report: &Report) -> String {
    format!(
        "You could save {:.2} vCPUs and {} Memory by changing the settings",
        report.cpu_delta(),
        Unit::Bytes.format(report.memory_delta())
    )
}

fn csv_amount(amount: Amount, unit: Unit) -> String {
    match (amount, unit) {
        (Amount::Value(v), Unit::Cores) => format!("{:.3}", v),
        (Amount::Value(v), Unit::Bytes) => format!("{:.0}", v),
        (Amount::Absent, _) => "absent".to_string(),
        (Amount::Undetermined, _) => "undetermined".to_string(),
    }
}

fn csv_delta(delta: Option<f64>, unit: Unit) -> String {
    delta
        .map(Amount::Value)
        .map(|d| csv_amount(d, unit))
        .unwrap_or_default()
}

pub fn csv_lines(report: &Report) -> Vec<String> {
    let mut lines = vec![
        [
            "Date",
            "Namespace",
            "Deployment",
            "Container",
            "Request CPU",
            "Current Request CPU",
            "Limit CPU",
            "Current Limit CPU",
            "Request Memory",
            "Current Request Memory",
            "Limit Memory",
            "Current Limit Memory",
            "CPU Delta",
            "Memory Delta",
        ]
        .join(","),
    ];
    let datetime = Utc::now().to_rfc3339();
    for r in report.rows() {
        let mut row = vec![
            datetime.clone(),
            r.namespace.clone(),
            r.workload.clone(),
            r.container.clone(),
        ];
        for (estimate, unit) in [
            (&r.request_cpu, Unit::Cores),
            (&r.limit_cpu, Unit::Cores),
            (&r.request_memory, Unit::Bytes),
            (&r.limit_memory, Unit::Bytes),
        ] {
            row.push(csv_amount(estimate.recommended, unit));
            row.push(csv_amount(estimate.current, unit));
        }
        row.push(csv_delta(r.cpu_delta, Unit::Cores));
        row.push(csv_delta(r.memory_delta, Unit::Bytes));
        lines.push(row.join(","));
    }
    lines
}

pub fn display_as_csv(report: &Report) {
    for line in csv_lines(report) {
        println!("{}", line);
    }
}

pub fn display_as_json(report: &Report) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

#[cfg(not(feature = "prettytable"))]
pub fn display_with_prettytable(report: &Report) {
    warn!("feature 'prettytable' not enabled");
    println!("{}", format_totals(report));
}

#[cfg(feature = "prettytable")]
fn style_of(estimate: &Estimate) -> &'static str {
    match estimate.advice {
        Advice::Keep => "rFg",
        Advice::Unknown => "rFr",
        Advice::Define | Advice::Increase | Advice::Decrease => "rFy",
    }
}

#[cfg(feature = "prettytable")]
pub fn display_with_prettytable(report: &Report) {
    // Create the table
    let mut table = Table::new();
    let format = format::FormatBuilder::new()
        .separators(&[], format::LineSeparator::new('-', '+', '+', '+'))
        .padding(1, 1)
        .build();
    table.set_format(format);
    table.set_titles(row![
        bl->"Namespace",
        bl->"Deployment",
        bl->"Container",
        br->"Request CPU (spec)",
        br->"Request MEM (spec)",
        br->"Limit CPU (spec)",
        br->"Limit MEM (spec)",
        bl->"Advice"
    ]);
    for r in report.rows() {
        table.add_row(Row::new(vec![
            Cell::new(&r.namespace),
            Cell::new(&r.workload),
            Cell::new(&r.container),
            Cell::new(&format_estimate(&r.request_cpu, Unit::Cores))
                .style_spec(style_of(&r.request_cpu)),
            Cell::new(&format_estimate(&r.request_memory, Unit::Bytes))
                .style_spec(style_of(&r.request_memory)),
            Cell::new(&format_estimate(&r.limit_cpu, Unit::Cores))
                .style_spec(style_of(&r.limit_cpu)),
            Cell::new(&format_estimate(&r.limit_memory, Unit::Bytes))
                .style_spec(style_of(&r.limit_memory)),
            Cell::new(&advices(r)),
        ]));
    }

    // Print the table to stdout
    table.printstd();
    println!("Total savings:");
    println!("{}", format_totals(report));
}
