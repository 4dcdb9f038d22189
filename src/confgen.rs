//! Rendering and in-place rewriting of the daemons' native config files.
//!
//! Only the fields the supervisor owns are rewritten: listen ports, socket
//! paths and the document root. Everything else in a user-edited file is kept.
use regex::{Captures, Regex};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

use crate::{
    config::{ConfigFormat, ServiceId},
    constants::SYSTEM_DATABASE_SOCKETS,
    runtime::StackLayout,
    settings::Settings,
};

/// Values substituted into every config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValues {
    pub nginx_port: u16,
    pub database_port: u16,
    pub fastcgi_socket: PathBuf,
    pub database_socket: PathBuf,
    pub docroot: PathBuf,
}

impl ConfigValues {
    pub fn from_settings(layout: &StackLayout, settings: &Settings) -> Self {
        Self {
            nginx_port: settings.nginx_port,
            database_port: settings.database_port,
            fastcgi_socket: settings.fastcgi_socket(layout),
            database_socket: settings.database_socket(layout),
            docroot: layout.www_dir(),
        }
    }
}

/// Path of the config file the supervisor manages for `service`.
pub fn config_path(layout: &StackLayout, service: ServiceId) -> PathBuf {
    match service {
        ServiceId::WebServer => layout.nginx_conf(),
        ServiceId::FastCgiManager => layout.php_fpm_conf(),
        ServiceId::Database => layout.mariadb_conf(),
    }
}

pub fn render(service: ServiceId, layout: &StackLayout, values: &ConfigValues) -> String {
    match service {
        ServiceId::WebServer => render_nginx(values),
        ServiceId::FastCgiManager => render_php_fpm(layout, values),
        ServiceId::Database => render_my_cnf(layout, values),
    }
}

pub fn render_nginx(values: &ConfigValues) -> String {
    format!(
        r#"worker_processes auto;
error_log logs/error.log;
pid nginx.pid;

events {{
    worker_connections 1024;
}}

http {{
    include mime.types;
    default_type application/octet-stream;

    sendfile on;
    keepalive_timeout 65;

    server {{
        listen {port};
        server_name localhost;
        root {docroot};
        index index.php index.html index.htm;

        location / {{
            try_files $uri $uri/ /index.php?$query_string;
        }}

        location ~ \.php$ {{
            fastcgi_pass unix:{socket};
            fastcgi_index index.php;
            fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;
            include fastcgi_params;
        }}

        location ~ /\.ht {{
            deny all;
        }}
    }}
}}
"#,
        port = values.nginx_port,
        docroot = values.docroot.display(),
        socket = values.fastcgi_socket.display(),
    )
}

pub fn render_php_fpm(layout: &StackLayout, values: &ConfigValues) -> String {
    format!(
        r#"[global]
pid = {pid}
error_log = {log}
daemonize = no

[www]
listen = {socket}
listen.mode = 0660
pm = dynamic
pm.max_children = 5
pm.start_servers = 2
pm.min_spare_servers = 1
pm.max_spare_servers = 3
"#,
        pid = layout.php_fpm_pid().display(),
        log = layout.php_current().join("logs/php-fpm.log").display(),
        socket = values.fastcgi_socket.display(),
    )
}

pub fn render_my_cnf(layout: &StackLayout, values: &ConfigValues) -> String {
    let dir = layout.mariadb_dir();
    let socket = values.database_socket.display();
    let port = values.database_port;
    let mut content = format!(
        r#"[client]
port = {port}
socket = {socket}

[mysqld]
basedir = {base}
datadir = {data}
port = {port}
socket = {socket}
pid-file = {pid}
log-error = {base}/logs/error.log
tmpdir = {base}/tmp
bind-address = 127.0.0.1
innodb_buffer_pool_size = 16M
loose-skip-symbolic-links = 1
"#,
        base = dir.display(),
        data = layout.mariadb_data().display(),
        pid = layout.mariadb_pid().display(),
    );
    for section in ["mariadb", "mysql", "mysqladmin", "mysqldump"] {
        content.push_str(&format!("\n[{section}]\nsocket = {socket}\n"));
    }
    content
}

fn replace_line(content: &str, pattern: &str, value: &str) -> String {
    let re = Regex::new(pattern).expect("valid regex");
    re.replace_all(content, |caps: &Captures| {
        let tail = caps.get(2).map_or("", |m| m.as_str());
        format!("{}{value}{tail}", &caps[1])
    })
    .into_owned()
}

/// Rewrites `listen`, `fastcgi_pass` and `root` in an nginx config.
pub fn rewrite_nginx(content: &str, values: &ConfigValues) -> String {
    let content = replace_line(
        content,
        r"(?m)^(\s*listen\s+(?:\S*:)?)\d+([^;\n]*;)",
        &values.nginx_port.to_string(),
    );
    let content = replace_line(
        &content,
        r"(?m)^(\s*fastcgi_pass\s+unix:)[^;\s]+(;)",
        &values.fastcgi_socket.display().to_string(),
    );
    replace_line(
        &content,
        r"(?m)^(\s*root\s+)[^;\n]+(;)",
        &values.docroot.display().to_string(),
    )
}

/// Rewrites the pool `listen` socket in a php-fpm config.
pub fn rewrite_php_fpm(content: &str, values: &ConfigValues) -> String {
    replace_line(
        content,
        r"(?m)^(\s*listen\s*=\s*)[^\n]*()$",
        &values.fastcgi_socket.display().to_string(),
    )
}

/// Rewrites every `port` and `socket` entry in a my.cnf.
pub fn rewrite_my_cnf(content: &str, values: &ConfigValues) -> String {
    let content = replace_line(
        content,
        r"(?m)^(\s*port\s*=\s*)\d+()",
        &values.database_port.to_string(),
    );
    replace_line(
        &content,
        r"(?m)^(\s*socket\s*=\s*)[^\n]*()$",
        &values.database_socket.display().to_string(),
    )
}

pub fn rewrite(service: ServiceId, content: &str, values: &ConfigValues) -> String {
    match service {
        ServiceId::WebServer => rewrite_nginx(content, values),
        ServiceId::FastCgiManager => rewrite_php_fpm(content, values),
        ServiceId::Database => rewrite_my_cnf(content, values),
    }
}

/// Minimal structural check: non-empty and shaped like the expected syntax.
pub fn validate(format: ConfigFormat, content: &str) -> Result<(), String> {
    if content.trim().is_empty() {
        return Err("file is empty".into());
    }

    match format {
        ConfigFormat::Nginx => {
            let mut depth: i64 = 0;
            for (number, line) in content.lines().enumerate() {
                let line = line.split('#').next().unwrap_or_default();
                for ch in line.chars() {
                    match ch {
                        '{' => depth += 1,
                        '}' => depth -= 1,
                        _ => {}
                    }
                    if depth < 0 {
                        return Err(format!("unexpected '}}' on line {}", number + 1));
                    }
                }
            }
            if depth != 0 {
                return Err("unbalanced braces".into());
            }
            if !content.contains(';') {
                return Err("no directives found".into());
            }
            Ok(())
        }
        ConfigFormat::Ini => {
            for (number, raw) in content.lines().enumerate() {
                let line = raw.trim();
                if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                    continue;
                }
                if line.starts_with('[') {
                    if !line.ends_with(']') || line.len() < 3 {
                        return Err(format!("malformed section header on line {}", number + 1));
                    }
                    continue;
                }
                if line.starts_with('!') {
                    continue;
                }
                let key = line.split('=').next().unwrap_or_default().trim();
                if key.is_empty() || key.contains(char::is_whitespace) {
                    return Err(format!("malformed entry on line {}", number + 1));
                }
            }
            Ok(())
        }
    }
}

/// The first system-wide database socket the config refers to, if any.
pub fn system_socket_reference(content: &str) -> Option<&'static str> {
    SYSTEM_DATABASE_SOCKETS
        .iter()
        .copied()
        .find(|socket| content.contains(socket))
}

/// Writes `content` through a temporary file and a rename.
pub fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}

/// Writes a freshly rendered config for `service`, replacing any existing file.
pub fn generate(
    service: ServiceId,
    layout: &StackLayout,
    values: &ConfigValues,
) -> io::Result<PathBuf> {
    let path = config_path(layout, service);
    write_atomic(&path, &render(service, layout, values))?;
    info!("Generated {} config at {}", service, path.display());
    Ok(path)
}

/// Rewrites the supervisor-owned fields of `service`'s config in place, generating it when absent.
///
/// Returns whether the file changed.
pub fn sync(service: ServiceId, layout: &StackLayout, values: &ConfigValues) -> io::Result<bool> {
    let path = config_path(layout, service);
    let current = match fs::read_to_string(&path) {
        Ok(content) if !content.trim().is_empty() => content,
        Ok(_) => {
            generate(service, layout, values)?;
            return Ok(true);
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            generate(service, layout, values)?;
            return Ok(true);
        }
        Err(err) => return Err(err),
    };

    let updated = rewrite(service, &current, values);
    if updated == current {
        debug!("{} config already up to date", service);
        return Ok(false);
    }
    write_atomic(&path, &updated)?;
    info!("Updated {} config at {}", service, path.display());
    Ok(true)
}

/// Pushes the settings' ports and socket paths into every config.
///
/// The FastCGI config is skipped while no runtime version is active.
pub fn apply_settings(layout: &StackLayout, settings: &Settings) -> io::Result<Vec<ServiceId>> {
    let values = ConfigValues::from_settings(layout, settings);
    let mut changed = Vec::new();
    for service in [ServiceId::WebServer, ServiceId::FastCgiManager, ServiceId::Database] {
        if service == ServiceId::FastCgiManager && !layout.php_current().is_dir() {
            debug!("No active runtime; skipping FastCGI config");
            continue;
        }
        if sync(service, layout, &values)? {
            changed.push(service);
        }
    }
    Ok(changed)
}
