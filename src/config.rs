// Конфигурация движка звонков
// Логирование можно отключить только в режиме разработки

use crate::peer::types::ServerConfig;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    // ВАЖНО: Эта настройка работает только в debug режиме!
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    // В продакшене все дополнительные настройки отключены
    pub const ENABLE_LOGGING: bool = false;
}

/// Публичный STUN по умолчанию; TURN не используется
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Сколько ждём ответа на входящий/исходящий звонок
pub const RING_TIMEOUT: Duration = Duration::from_secs(45);

/// Период ожидания перед принудительным отключением
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Максимум отложенных remote-кандидатов до установки remote description
pub const ICE_QUEUE_CAP: usize = 100;

/// Параметры контроллера звонков
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ring_timeout: Duration,
    pub grace_period: Duration,
    pub ice_queue_cap: usize,
    pub ice_servers: Vec<ServerConfig>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: RING_TIMEOUT,
            grace_period: GRACE_PERIOD,
            ice_queue_cap: ICE_QUEUE_CAP,
            ice_servers: vec![ServerConfig {
                id: "default-stun".into(),
                r#type: "stun".into(),
                url: DEFAULT_STUN_URL.into(),
                username: None,
                credential: None,
            }],
        }
    }
}
