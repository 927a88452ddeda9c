//! User-facing texts (HTML parse mode). Dynamic values always go through [`escape`].

use crate::app::health::HealthStatus;
use crate::app::manager::{LoadOutcome, LoadSource};
use crate::app::probe::ProbeResult;
use crate::app::status::StatusReport;
use crate::common::error::AgentError;
use crate::config::subscription::Server;

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape `text` into at most `max_chars` characters, never splitting an entity.
pub fn escape_limited(text: &str, max_chars: usize) -> String {
    let full = escape(text);
    if full.chars().count() <= max_chars {
        return full;
    }
    let mut out = String::new();
    let mut used = 0usize;
    for c in text.chars() {
        let piece = escape(c.encode_utf8(&mut [0u8; 4]));
        let width = piece.chars().count();
        // 留一个位置给省略号
        if used + width + 1 > max_chars {
            break;
        }
        out.push_str(&piece);
        used += width;
    }
    out.push('…');
    out
}

/// Longest block of command output shown after `/update`.
const UPDATE_OUTPUT_CHARS: usize = 3500;
/// Ping result lines stop here; the rest are summarised in one line.
const PING_RESULTS_CHARS: usize = 3800;

pub const UNAUTHORISED: &str = "⛔ Доступ запрещён. Этот бот обслуживает только администратора.";
pub const RATE_LIMITED: &str = "⏳ Слишком много команд. Подождите минуту и повторите.";
pub const CANCELLED: &str = "Действие отменено.";
pub const UPDATE_NOT_CONFIGURED: &str = "ℹ️ Команда обновления не настроена (<code>update_command</code>).";

pub fn help() -> String {
    [
        "<b>Команды</b>",
        "/start — главное меню",
        "/list — список серверов",
        "/status — состояние",
        "/ping — проверить доступность серверов",
        "/refresh — обновить подписку",
        "/update — обновить агент",
    ]
    .join("\n")
}

pub fn menu(active: Option<&Server>, servers_count: usize) -> String {
    let current = match active {
        Some(s) => format!("<b>{}</b>", escape(&s.name)),
        None => "не выбран".to_string(),
    };
    format!(
        "🛰 <b>xswitch</b>\n\nТекущий сервер: {}\nСерверов в подписке: {}",
        current, servers_count
    )
}

pub fn server_list(page: usize, total_pages: usize, servers_count: usize) -> String {
    format!(
        "📋 <b>Серверы</b> ({})\nСтраница {} из {}\n\nВыберите сервер:",
        servers_count,
        page + 1,
        total_pages.max(1)
    )
}

pub fn confirm_switch(server: &Server) -> String {
    format!(
        "Переключиться на <b>{}</b>?\n<code>{}</code>",
        escape(&server.name),
        escape(&server.endpoint())
    )
}

pub fn switching(server: &Server) -> String {
    format!("🔄 Переключение на <b>{}</b>…", escape(&server.name))
}

pub fn switched(server: &Server) -> String {
    format!(
        "✅ Активный сервер: <b>{}</b>\n<code>{}</code>",
        escape(&server.name),
        escape(&server.endpoint())
    )
}

pub fn loaded(outcome: &LoadOutcome) -> String {
    let note = match outcome.source {
        LoadSource::Network => "",
        LoadSource::Cache => " (из кэша)",
        LoadSource::StaleCache => " (устаревший кэш: подписка недоступна)",
    };
    format!("🔃 Подписка обновлена: {} серверов{}", outcome.count, note)
}

/// Short explanation of an error, no internals beyond the error message.
pub fn error(err: &AgentError) -> String {
    let text = match err {
        AgentError::ServerNotFound(_) => "Сервер не найден. Обновите список.".to_string(),
        AgentError::AlreadyActive(name) => format!("Сервер <b>{}</b> уже активен.", escape(name)),
        AgentError::SwitchInProgress => "Переключение уже выполняется, подождите.".to_string(),
        AgentError::NoServers => "В подписке нет подходящих серверов (vless).".to_string(),
        AgentError::FetchFailed(reason) => {
            format!("Не удалось загрузить подписку: {}", escape(reason))
        }
        AgentError::DecodeFailed(_) | AgentError::ParseFailed(_) => {
            "Подписка повреждена: не удалось разобрать содержимое.".to_string()
        }
        AgentError::ConfigWriteFailed(reason) => format!(
            "Не удалось записать конфиг Xray: {}\nПредыдущий сервер остаётся активным.",
            escape(reason)
        ),
        AgentError::RestartFailed(reason) => format!(
            "Перезапуск Xray не удался: {}\nКонфиг возвращён, предыдущий сервер остаётся активным.",
            escape(reason)
        ),
        AgentError::RestartFailedRollbackFailed { .. } => {
            "Критическая ошибка: перезапуск и откат конфига не удались. Агент останавливается."
                .to_string()
        }
        AgentError::CommandRejected(reason) => format!("Команда отклонена: {}", escape(reason)),
        AgentError::Unauthorised(_) => UNAUTHORISED.to_string(),
        AgentError::RateLimited => RATE_LIMITED.to_string(),
        other => format!("Внутренняя ошибка: {}", escape(&other.to_string())),
    };
    format!("❌ {}", text)
}

pub fn status(report: &StatusReport) -> String {
    let mut lines = vec![
        "📊 <b>Состояние</b>".to_string(),
        String::new(),
        format!(
            "Агент: {}",
            if report.running { "работает" } else { "остановлен" }
        ),
    ];
    match &report.current_server {
        Some(s) => lines.push(format!(
            "Сервер: <b>{}</b> (<code>{}</code>)",
            escape(&s.name),
            escape(&s.id)
        )),
        None => lines.push("Сервер: не выбран".to_string()),
    }
    lines.push(format!("Серверов: {}", report.servers_count));
    if let Some(cache) = &report.cache {
        lines.push(format!("Подписка загружена: {} назад", human_age(cache.age_secs)));
    }
    if let Some(health) = &report.health {
        if health.enabled {
            let state = match &health.status {
                HealthStatus::Healthy => "✅ в порядке".to_string(),
                HealthStatus::Degraded(reason) => format!("⚠️ {}", escape(reason)),
                HealthStatus::Unknown => "нет данных".to_string(),
            };
            lines.push(format!(
                "Проверка здоровья (каждые {} с): {}",
                health.interval_secs, state
            ));
        } else {
            lines.push("Проверка здоровья: отключена".to_string());
        }
    }
    lines.push(format!(
        "Конфиг: <code>{}</code>",
        escape(&report.config_path.display().to_string())
    ));
    lines.push(format!("Уровень логов: {}", report.log_level.as_str()));
    lines.join("\n")
}

pub fn ping_progress(completed: usize, total: usize, last: Option<&str>) -> String {
    let filled = if total == 0 { 10 } else { (completed * 10 / total).min(10) };
    let bar: String = "▓".repeat(filled) + &"░".repeat(10 - filled);
    let mut text = format!("📡 Проверка серверов…\n{} {}/{}", bar, completed, total);
    if let Some(name) = last {
        text.push_str(&format!("\nПоследний: {}", escape(name)));
    }
    text
}

/// Results must already be sorted.
pub fn ping_results(results: &[ProbeResult]) -> String {
    let available = results.iter().filter(|r| r.available).count();
    let mut text = format!(
        "📡 <b>Результаты</b>: доступно {} из {}\n",
        available,
        results.len()
    );
    let mut used = text.chars().count();
    for (shown, r) in results.iter().enumerate() {
        let line = match (r.available, r.latency_ms, r.error) {
            (true, Some(ms), _) => format!("🟢 {} — {} мс", escape(&r.server_name), ms),
            (_, _, Some(kind)) => format!("🔴 {} — {}", escape(&r.server_name), kind.as_str()),
            _ => format!("🔴 {}", escape(&r.server_name)),
        };
        let width = line.chars().count() + 1;
        if used + width > PING_RESULTS_CHARS {
            text.push_str(&format!("\n… и ещё {}", results.len() - shown));
            break;
        }
        text.push('\n');
        text.push_str(&line);
        used += width;
    }
    text
}

pub fn update_confirm() -> String {
    "Запустить обновление агента?".to_string()
}

pub fn update_started() -> String {
    "⬇️ Обновление запущено…".to_string()
}

pub fn update_done(output: &str) -> String {
    if output.is_empty() {
        "✅ Обновление завершено.".to_string()
    } else {
        format!(
            "✅ Обновление завершено.\n<pre>{}</pre>",
            escape_limited(output, UPDATE_OUTPUT_CHARS)
        )
    }
}

pub fn update_failed(reason: &str) -> String {
    format!("❌ Обновление не удалось: {}", escape(reason))
}

fn human_age(secs: u64) -> String {
    match secs {
        0..=59 => format!("{} с", secs),
        60..=3599 => format!("{} мин", secs / 60),
        _ => format!("{} ч {} мин", secs / 3600, (secs % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::probe::ProbeErrorKind;
    use crate::bot::transport::{MessageContent, MessageType, MAX_MESSAGE_CHARS};

    #[test]
    fn html_escaped() {
        assert_eq!(escape("<b>&\"x\"</b>"), "&lt;b&gt;&amp;&quot;x&quot;&lt;/b&gt;");
        assert_eq!(escape("Германия 🇩🇪"), "Германия 🇩🇪");
    }

    #[test]
    fn user_facing_errors_are_short() {
        let text = error(&AgentError::SwitchInProgress);
        assert!(text.starts_with("❌"));
        let text = error(&AgentError::RestartFailed("exit code 1".into()));
        assert!(text.contains("exit code 1"));
        assert!(text.contains("предыдущий сервер"));
        let text = error(&AgentError::AlreadyActive("<evil>".into()));
        assert!(text.contains("&lt;evil&gt;"));
    }

    #[test]
    fn progress_bar() {
        let text = ping_progress(5, 10, Some("DE"));
        assert!(text.contains("▓▓▓▓▓░░░░░ 5/10"));
        assert!(text.contains("DE"));
        assert!(ping_progress(0, 0, None).contains("0/0"));
    }

    #[test]
    fn ping_results_lines() {
        let results = vec![
            ProbeResult {
                server_id: "a".into(),
                server_name: "Fast".into(),
                available: true,
                latency_ms: Some(12),
                error: None,
                measured_at: 0,
            },
            ProbeResult {
                server_id: "b".into(),
                server_name: "Dead".into(),
                available: false,
                latency_ms: None,
                error: Some(ProbeErrorKind::Timeout),
                measured_at: 0,
            },
        ];
        let text = ping_results(&results);
        assert!(text.contains("доступно 1 из 2"));
        assert!(text.contains("🟢 Fast — 12 мс"));
        assert!(text.contains("🔴 Dead — timeout"));
    }

    #[test]
    fn long_update_output_keeps_pre_closed() {
        let text = update_done(&"x".repeat(5000));
        assert!(text.chars().count() <= MAX_MESSAGE_CHARS);
        assert!(text.ends_with("…</pre>"));

        // 截断点不落在实体中间
        let text = update_done(&"&".repeat(2000));
        assert!(text.chars().count() <= MAX_MESSAGE_CHARS);
        let body = text
            .trim_start_matches("✅ Обновление завершено.\n<pre>")
            .trim_end_matches("…</pre>");
        assert_eq!(body.len() % "&amp;".len(), 0);
        assert!(body.split("&amp;").all(str::is_empty));
    }

    #[test]
    fn escape_limited_short_input_untouched() {
        assert_eq!(escape_limited("a<b", 10), "a&lt;b");
        assert_eq!(escape_limited("a<b", 3), "a…");
    }

    #[test]
    fn many_ping_results_fit_one_message() {
        let results: Vec<ProbeResult> = (0..300)
            .map(|i| ProbeResult {
                server_id: format!("id{i}"),
                server_name: format!("R&D node <{i}> Frankfurt"),
                available: false,
                latency_ms: None,
                error: Some(ProbeErrorKind::Unreachable),
                measured_at: 0,
            })
            .collect();
        let text = ping_results(&results);
        assert!(text.chars().count() <= MAX_MESSAGE_CHARS);
        assert!(text.contains("… и ещё "));
        assert!(text.contains("из 300"));
        // MessageContent 不需要再截断
        let content = MessageContent::new(MessageType::PingResult, text.clone());
        assert_eq!(content.text, text);
        for line in text.lines().skip(2) {
            let whole = line.starts_with("🔴 ") && line.ends_with("unreachable");
            assert!(whole || line.starts_with('…'), "{line}");
        }
    }

    #[test]
    fn ages() {
        assert_eq!(human_age(5), "5 с");
        assert_eq!(human_age(120), "2 мин");
        assert_eq!(human_age(3_720), "1 ч 2 мин");
    }
}
