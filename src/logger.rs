/// Логирование с временными метками
pub fn log(msg: &str) {
    // Проверяем конфигурацию логирования
    if crate::config::LOGGING_ENABLED {
        if !crate::config::dev::ENABLE_LOGGING {
            return;
        }

        let now = chrono::Local::now();
        println!("CALL: [{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), msg);
    }
}

/// Предупреждение: не фатально, но заслуживает внимания
pub fn warn(msg: &str) {
    if crate::config::LOGGING_ENABLED {
        if !crate::config::dev::ENABLE_LOGGING {
            return;
        }

        let now = chrono::Local::now();
        println!(
            "CALL: [{}] WARN: {}",
            now.format("%Y-%m-%d %H:%M:%S%.3f"),
            msg
        );
    }
}
