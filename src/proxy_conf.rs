//! Proxy installation preparation: served-content root and config file

use std::io;
use std::path::Path;

/// Render the proxy configuration routing `.php` requests to the backend
pub fn render(listen_port: u16, backend_port: u16) -> String {
    format!(
        r#"
worker_processes  1;

events {{
    worker_connections  1024;
}}

http {{
    include       mime.types;
    default_type  application/octet-stream;
    client_max_body_size 100M;

    sendfile        on;
    keepalive_timeout  65;

    server {{
        listen {listen_port};
        server_name localhost;
        root   html;

        location / {{
            index index.html index.htm index.php;

            if ($request_method = 'OPTIONS') {{
                add_header 'Access-Control-Allow-Origin' '*';
                add_header 'Access-Control-Allow-Methods' 'GET, POST, OPTIONS';
                add_header 'Access-Control-Max-Age' 1728000;
                add_header 'Content-Type' 'text/plain; charset=utf-8';
                add_header 'Content-Length' 0;
                return 204;
            }}
            if ($request_method = 'POST') {{
                add_header 'Access-Control-Allow-Origin' '*' always;
                add_header 'Access-Control-Allow-Methods' 'GET, POST, OPTIONS' always;
                add_header 'Access-Control-Allow-Headers' 'DNT,User-Agent,X-Requested-With,If-Modified-Since,Cache-Control,Content-Type,Range' always;
                add_header 'Access-Control-Expose-Headers' 'Content-Length,Content-Range' always;
            }}
            if ($request_method = 'GET') {{
                add_header 'Access-Control-Allow-Origin' '*' always;
                add_header 'Access-Control-Allow-Methods' 'GET, POST, OPTIONS' always;
                add_header 'Access-Control-Allow-Headers' 'DNT,User-Agent,X-Requested-With,If-Modified-Since,Cache-Control,Content-Type,Range' always;
                add_header 'Access-Control-Expose-Headers' 'Content-Length,Content-Range' always;
            }}
        }}

        location ~ \.php$ {{
            fastcgi_pass 127.0.0.1:{backend_port};
            fastcgi_index index.php;
            fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;
            fastcgi_read_timeout 180;
            fastcgi_buffers 64 16k;
            fastcgi_buffer_size 32k;
            include fastcgi_params;
        }}

        location /nginx_status {{
            stub_status on;
            access_log   off;
            allow 127.0.0.1;
            deny all;
        }}
    }}
}}"#
    )
}

/// Write the rendered config to `path`, creating its directory if needed
pub fn write(path: &Path, listen_port: u16, backend_port: u16) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, render(listen_port, backend_port))
}

/// Create the served-content root if absent; returns true if it was created
pub fn ensure_web_root(path: &Path) -> io::Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }
    std::fs::create_dir_all(path)?;
    Ok(true)
}

/// Let the account the proxy serves content as read and traverse `path`
#[cfg(unix)]
pub fn grant_read_execute(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o055);
    std::fs::set_permissions(path, permissions)
}

/// Let the account the proxy serves content as read and traverse `path`
#[cfg(not(unix))]
pub fn grant_read_execute(path: &Path) -> io::Result<()> {
    // Access control lists are inherited from the installation directory
    std::fs::metadata(path).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_embeds_ports() {
        let conf = render(8080, 9001);
        assert!(conf.contains("listen 8080;"));
        assert!(conf.contains("fastcgi_pass 127.0.0.1:9001;"));
        assert!(conf.contains("worker_processes  1;"));
    }

    #[test]
    fn test_write_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("nginx.conf");

        write(&path, 80, 9000).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("listen 80;"));
    }

    #[test]
    fn test_ensure_web_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("html");

        assert!(ensure_web_root(&root).unwrap());
        assert!(root.is_dir());
        assert!(!ensure_web_root(&root).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_grant_read_execute_sets_bits() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("html");
        std::fs::create_dir(&root).unwrap();
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700)).unwrap();

        grant_read_execute(&root).unwrap();

        let mode = std::fs::metadata(&root).unwrap().permissions().mode();
        assert_eq!(mode & 0o055, 0o055);
    }

    #[test]
    fn test_grant_on_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(grant_read_execute(&dir.path().join("missing")).is_err());
    }
}
