//! Server-rendered HTML for the device verification flow.
use crate::device::DeviceAuthorizationRecord;

const STYLE: &str = r#"
        body { font-family: sans-serif; max-width: 600px; margin: 50px auto; padding: 20px; }
        .container { background: #f5f5f5; padding: 30px; border-radius: 8px; }
        h1 { margin-top: 0; }
        input { font-size: 18px; padding: 10px; box-sizing: border-box; margin: 10px 0; }
        .code input { width: 40%; text-transform: uppercase; font-family: monospace; letter-spacing: 2px; }
        .credentials input { width: 100%; }
        button { padding: 12px 24px; font-size: 16px; border: none; border-radius: 4px; cursor: pointer; color: white; background: #007bff; }
        .approve { background: #28a745; }
        .deny { background: #dc3545; }
        .buttons { display: flex; gap: 10px; margin-top: 20px; }
        .buttons button { flex: 1; }
        .error { background: #f8d7da; border-left: 4px solid #dc3545; padding: 15px; margin-bottom: 20px; color: #721c24; }
        .warning { background: #fff3cd; border-left: 4px solid #ffc107; padding: 15px; margin-bottom: 20px; }
        .device-info { background: white; padding: 15px; border-radius: 4px; margin: 20px 0; }
        .device-info dt { font-weight: bold; margin-top: 10px; }
        .device-info dd { margin-left: 0; color: #555; }
        .code-display { background: #007bff; color: white; padding: 15px; text-align: center; font-size: 24px; font-family: monospace; border-radius: 4px; letter-spacing: 2px; }
"#;

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
    <style>{STYLE}</style>
</head>
<body>
    <div class="container">
{body}
    </div>
</body>
</html>"#,
        title = html_escape(title),
    )
}

fn error_block(error: Option<&str>) -> String {
    match error {
        Some(message) => format!(
            r#"        <div class="error" id="errorMessage">{}</div>
"#,
            html_escape(message)
        ),
        None => String::new(),
    }
}

/// Two-box user_code entry form.
pub fn user_code_entry(action: &str, error: Option<&str>) -> String {
    let body = format!(
        r#"        <h1>Device Verification</h1>
{error}        <p>Enter the code shown on your device.</p>
        <form id="deviceAuthzForm" method="POST" action="{action}" class="code">
            <input type="text" id="userCodePart1" name="userCodePart1" maxlength="4" autocomplete="off" required autofocus>
            -
            <input type="text" id="userCodePart2" name="userCodePart2" maxlength="4" autocomplete="off" required>
            <div><button type="submit" id="continueButton">Continue</button></div>
        </form>"#,
        error = error_block(error),
        action = html_escape(action),
    );
    layout("Device Verification", &body)
}

/// Login plus approve/deny form for a resolved record.
pub fn consent(action: &str, record: &DeviceAuthorizationRecord, error: Option<&str>) -> String {
    let info = record.device_info.clone().unwrap_or_default();
    let body = format!(
        r#"        <h1>Authorize Device</h1>
{error}        <div class="warning">
            <strong>Verify this is your device!</strong> Only approve if you recognize the details below.
        </div>
        <div class="code-display">{user_code}</div>
        <div class="device-info">
            <dl>
                <dt>Client:</dt>
                <dd>{client}</dd>
                <dt>Requested Scopes:</dt>
                <dd>{scopes}</dd>
                <dt>IP Address:</dt>
                <dd>{ip}</dd>
                <dt>User Agent:</dt>
                <dd>{user_agent}</dd>
            </dl>
        </div>
        <form id="loginForm" method="POST" action="{action}" class="credentials">
            <input type="hidden" name="record_id" value="{record_id}">
            <input type="hidden" name="user_code" value="{user_code}">
            <input type="text" id="username" name="username" placeholder="Username" required>
            <input type="password" id="password" name="password" placeholder="Password" required>
            <div class="buttons">
                <button type="submit" id="authorizeButton" name="action" value="approve" class="approve">Allow</button>
                <button type="submit" id="denyButton" name="action" value="deny" class="deny">Deny</button>
            </div>
        </form>"#,
        error = error_block(error),
        user_code = html_escape(&record.user_code),
        client = html_escape(
            record
                .client_name
                .as_deref()
                .unwrap_or(record.client_id.as_str())
        ),
        scopes = html_escape(&record.scope_string()),
        ip = html_escape(info.ip_address.as_deref().unwrap_or("Unknown")),
        user_agent = html_escape(info.user_agent.as_deref().unwrap_or("Unknown")),
        action = html_escape(action),
        record_id = record.id,
    );
    layout("Authorize Device", &body)
}

pub fn approved() -> String {
    layout(
        "Device Approved",
        r#"        <h1>Device Approved</h1>
        <p id="resultMessage">You can now return to your device and continue.</p>"#,
    )
}

pub fn denied() -> String {
    layout(
        "Device Denied",
        r#"        <h1>Device Access Denied</h1>
        <p id="resultMessage">The authorization request has been rejected.</p>"#,
    )
}

/// Terminal message page (expired request, conflicting decision).
pub fn message(title: &str, text: &str) -> String {
    let body = format!(
        r#"        <h1>{}</h1>
        <p id="resultMessage">{}</p>"#,
        html_escape(title),
        html_escape(text)
    );
    layout(title, &body)
}

pub fn too_many_attempts_text(retry_after: i64) -> String {
    let minutes = (retry_after + 59) / 60;
    format!(
        "Too many failed attempts. Try again in {} minute{}.",
        minutes,
        if minutes == 1 { "" } else { "s" }
    )
}

pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
