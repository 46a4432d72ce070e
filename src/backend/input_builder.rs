use crate::backend::SimpleInput;
use actix_web::dev::ServiceRequest;
use actix_web::ResponseError;
use std::future::{ready, Ready};
use std::net::{AddrParseError, IpAddr, Ipv6Addr};
use std::time::Duration;
use thiserror::Error;

type CustomFn = Box<dyn Fn(&ServiceRequest) -> Result<String, actix_web::Error>>;

pub type SimpleInputFuture = Ready<Result<SimpleInput, actix_web::Error>>;

/// Utility to create an input function that produces a [SimpleInput].
///
/// The components selected here make up the client key; requests with equal keys share one
/// sliding window. You should take care to ensure that you are producing unique keys per backend.
///
/// This will not be of any use if you want to use dynamic capacity/window policies
/// or perform an asynchronous operation; you should instead write your own input function.
pub struct SimpleInputFunctionBuilder {
    window: Duration,
    capacity: u64,
    real_ip_key: bool,
    peer_ip_key: bool,
    path_key: bool,
    custom_key: Option<String>,
    custom_fn: Option<CustomFn>,
}

impl SimpleInputFunctionBuilder {
    pub fn new(window: Duration, capacity: u64) -> Self {
        Self {
            window,
            capacity,
            real_ip_key: false,
            peer_ip_key: false,
            path_key: false,
            custom_key: None,
            custom_fn: None,
        }
    }

    /// Adds the client's real IP to the client key.
    ///
    /// # Security
    ///
    /// This calls
    /// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr)
    /// internally which is only suitable for Actix applications deployed behind a proxy that you
    /// control.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn real_ip_key(mut self) -> Self {
        self.real_ip_key = true;
        self
    }

    /// Adds the connection peer IP to the client key.
    ///
    /// This is suitable when clients connect directly to the Actix application.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn peer_ip_key(mut self) -> Self {
        self.peer_ip_key = true;
        self
    }

    /// Add the request path to the client key
    pub fn path_key(mut self) -> Self {
        self.path_key = true;
        self
    }

    /// Add a custom component to the client key
    pub fn custom_key(mut self, key: &str) -> Self {
        self.custom_key = Some(key.to_owned());
        self
    }

    /// Dynamically add a custom component to the client key
    pub fn custom_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Result<String, actix_web::Error> + 'static,
    {
        self.custom_fn = Some(Box::new(f));
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> SimpleInputFuture + 'static {
        move |req| {
            ready((|| {
                let mut components = Vec::new();
                let info = req.connection_info();
                if let Some(custom) = &self.custom_key {
                    components.push(custom.clone());
                }
                if self.real_ip_key {
                    let addr = info.realip_remote_addr().ok_or(InputError::MissingAddress)?;
                    components.push(ip_key(addr)?)
                }
                if self.peer_ip_key {
                    let addr = info.peer_addr().ok_or(InputError::MissingAddress)?;
                    components.push(ip_key(addr)?)
                }
                if self.path_key {
                    components.push(req.path().to_owned());
                }
                if let Some(f) = &self.custom_fn {
                    components.push(f(req)?)
                }
                let key = components.join("-");

                Ok(SimpleInput {
                    window: self.window,
                    capacity: self.capacity,
                    key,
                })
            })())
        }
    }
}

/// Failure to derive a client key from a request.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Unable to parse remote IP address: {0}")]
    InvalidIp(
        #[source]
        #[from]
        AddrParseError,
    ),
    #[error("Request has no remote address")]
    MissingAddress,
}

impl ResponseError for InputError {}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ip_key(ip_str: &str) -> Result<String, InputError> {
    // realip_remote_addr may still carry the port when taken from the socket
    let ip = match ip_str.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(e) => match ip_str.parse::<std::net::SocketAddr>() {
            Ok(addr) => addr.ip(),
            Err(_) => return Err(e.into()),
        },
    };
    Ok(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return Ok(v4.to_string());
            }
            let segments = v6.segments();
            let subnet = Ipv6Addr::new(segments[0], segments[1], segments[2], segments[3], 0, 0, 0, 0);
            format!("{}/64", subnet)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_ip_key() {
        // Check that IPv4 addresses are preserved
        assert_eq!(ip_key("142.250.187.206").unwrap(), "142.250.187.206");
        // Ports are ignored
        assert_eq!(ip_key("142.250.187.206:8080").unwrap(), "142.250.187.206");
        // Check that IPv4 mapped addresses are preserved
        assert_eq!(ip_key("::FFFF:142.250.187.206").unwrap(), "142.250.187.206");
        // Check that IPv6 addresses are grouped into /64 subnets
        assert_eq!(
            ip_key("2a00:1450:4009:81f::200e").unwrap(),
            "2a00:1450:4009:81f::/64"
        );
        assert!(matches!(ip_key("not-an-ip"), Err(InputError::InvalidIp(_))));
    }

    #[actix_web::test]
    async fn test_build_key() {
        let input_fn = SimpleInputFunctionBuilder::new(Duration::from_secs(60), 100)
            .custom_key("api")
            .peer_ip_key()
            .path_key()
            .build();
        let req = TestRequest::get()
            .uri("/items")
            .peer_addr("10.0.0.7:4000".parse().unwrap())
            .to_srv_request();
        let input = input_fn(&req).await.unwrap();
        assert_eq!(input.key, "api-10.0.0.7-/items");
        assert_eq!(input.capacity, 100);
        assert_eq!(input.window, Duration::from_secs(60));
    }

    #[actix_web::test]
    async fn test_missing_peer_address() {
        let input_fn = SimpleInputFunctionBuilder::new(Duration::from_secs(60), 100)
            .peer_ip_key()
            .build();
        let req = TestRequest::get().to_srv_request();
        assert!(input_fn(&req).await.is_err());
    }
}
