//! Физические и справочные константы учёта.

/// Коэффициент PUE (Daniel Bizo, 2023, Uptime Institute Global Data Center Survey).
pub const PUE_2023: f64 = 1.58;

/// Среднемировая углеродная интенсивность электроэнергии за 2019 год, gCO2/kWh.
pub const WORLD_2019_CARBON_INTENSITY: f64 = 475.0;

/// Джоулей в одном киловатт-часе.
pub const JOULES_PER_KWH: f64 = 3_600_000.0;

/// Код завершения для необработанной ошибки (EX_SOFTWARE).
pub const EX_SOFTWARE: i32 = 70;

/// Строка о PUE, с которой начинается стандартный лог.
pub const PUE_STATEMENT: &str = "Only predicted and actual consumptions are multiplied by a PUE \
coefficient of 1.58 (Daniel Bizo, 2023, Uptime Institute Global Data Center Survey).";
