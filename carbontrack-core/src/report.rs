//! Отчёты о потреблении: прогноз, фактическое потребление и эквиваленты CO2eq.

use crate::logging::format_duration;

/// Строка таблицы эквивалентов: `(единица, gCO2eq на единицу, нижняя граница, верхняя граница)`.
///
/// Эквивалент показывается, когда значение в единицах попадает в
/// `[lower, upper)`; граница `None` не ограничивает.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConversionRow {
    pub unit: &'static str,
    pub g_per_unit: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

/// Встроенная таблица эквивалентов (EEA 2023: средний легковой автомобиль
/// 120.4 gCO2/km; EPA: зарядка смартфона 8.22 gCO2).
pub const CONVERSIONS: &[ConversionRow] = &[
    ConversionRow {
        unit: "km travelled by car",
        g_per_unit: 120.4,
        lower: None,
        upper: None,
    },
    ConversionRow {
        unit: "smartphone charges",
        g_per_unit: 8.22,
        lower: None,
        upper: None,
    },
];

/// Эквивалент выброса в наглядных единицах.
#[derive(Debug, Clone, PartialEq)]
pub struct Equivalent {
    pub value: f64,
    pub unit: String,
}

/// Перевести граммы CO2eq в эквиваленты из таблицы.
pub fn co2eq_equivalents(g_co2eq: f64, table: &[ConversionRow]) -> Vec<Equivalent> {
    table
        .iter()
        .filter_map(|row| {
            if row.g_per_unit <= 0.0 {
                return None;
            }
            let value = g_co2eq / row.g_per_unit;
            let above_lower = row.lower.map_or(true, |lower| value >= lower);
            let below_upper = row.upper.map_or(true, |upper| value < upper);
            (above_lower && below_upper).then(|| Equivalent {
                value,
                unit: row.unit.to_string(),
            })
        })
        .collect()
}

/// Прогноз энергии на все эпохи: `epochs × mean(epoch_energies)`.
pub fn predict_energy(total_epochs: u64, epoch_energies: &[f64]) -> f64 {
    total_epochs as f64 * mean(epoch_energies)
}

/// Прогноз времени на все эпохи: `epochs × mean(epoch_durations)`.
pub fn predict_time(total_epochs: u64, epoch_durations: &[f64]) -> f64 {
    total_epochs as f64 * mean(epoch_durations)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Вид отчёта.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Predicted { epochs: u64 },
    Actual { epochs: u64 },
    /// Фактическое потребление при отключённом прогнозе.
    ActualOnly,
}

impl ReportKind {
    pub fn description(&self) -> String {
        match self {
            ReportKind::Predicted { epochs } => format!("Predicted consumption for {epochs} epoch(s):"),
            ReportKind::Actual { epochs } => format!("Actual consumption for {epochs} epoch(s):"),
            ReportKind::ActualOnly => "Actual consumption:".to_string(),
        }
    }
}

/// Блок отчёта о потреблении.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumptionReport {
    pub kind: ReportKind,
    pub duration_secs: f64,
    pub energy_kwh: f64,
    pub co2eq_g: f64,
    pub equivalents: Vec<Equivalent>,
}

impl ConsumptionReport {
    /// Собрать отчёт; эквиваленты добавляются при `interpretable`.
    pub fn new(kind: ReportKind, duration_secs: f64, energy_kwh: f64, intensity: f64, interpretable: bool) -> Self {
        let co2eq_g = energy_kwh * intensity;
        let equivalents = if interpretable {
            co2eq_equivalents(co2eq_g, CONVERSIONS)
        } else {
            Vec::new()
        };
        Self {
            kind,
            duration_secs,
            energy_kwh,
            co2eq_g,
            equivalents,
        }
    }

    /// Текст блока с `precision` знаками после запятой.
    pub fn render(&self, precision: usize) -> String {
        let mut text = format!(
            "\n{}\n\tTime:\t{}\n\tEnergy:\t{:.*} kWh\n\tCO2eq:\t{:.*} g",
            self.kind.description(),
            format_duration(self.duration_secs, false),
            precision,
            self.energy_kwh,
            precision,
            self.co2eq_g
        );
        if !self.equivalents.is_empty() {
            text.push_str("\n\tThis is equivalent to:");
            for equivalent in &self.equivalents {
                text.push_str(&format!("\n\t{:.*} {}", precision, equivalent.value, equivalent.unit));
            }
        }
        text
    }
}
