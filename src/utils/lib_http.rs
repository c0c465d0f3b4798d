use std::time::Duration;

use reqwest::{
    blocking::Client,
    header::{ACCEPT, USER_AGENT},
    StatusCode,
};
use thiserror::Error;

use super::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },
    #[error("request to {url} returned {status}")]
    Status { url: String, status: StatusCode },
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),
}

impl FetchError {
    /// Network hiccups and server side errors are worth another try.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_body()
            }
            FetchError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            FetchError::Client(_) => false,
        }
    }
}

/// Something that can get the body of a url.  `Ok(None)` means the server
/// answered 404.
pub trait Download {
    fn download(&self, url: &str) -> Result<Option<Vec<u8>>, FetchError>;
}

pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Result<HttpClient, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(HttpClient { client, retry })
    }

    fn get_once(&self, url: &str) -> Result<Option<Vec<u8>>, FetchError> {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36")
            .header(ACCEPT, "*/*")
            .send()
            .map_err(transport)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        let body = response.bytes().map_err(transport)?;
        Ok(Some(body.to_vec()))
    }
}

impl Download for HttpClient {
    fn download(&self, url: &str) -> Result<Option<Vec<u8>>, FetchError> {
        self.retry.run(|| self.get_once(url), FetchError::is_transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[ignore]
    #[test]
    fn download_calendar() -> Result<(), Box<dyn Error>> {
        let client = HttpClient::new(Duration::from_secs(30), RetryPolicy::default())?;
        let body = client.download(
            "https://www.sedlabanki.is/library/Fylgiskjol/Hagtolur/Birtingar_2021%20Calendar.ics",
        )?;
        assert!(body.is_some());
        Ok(())
    }

    fn client(max_attempts: u32) -> HttpClient {
        let retry = RetryPolicy {
            max_attempts,
            initial_wait: Duration::from_millis(1),
        };
        HttpClient::new(Duration::from_secs(5), retry).unwrap()
    }

    #[test]
    fn not_found_is_not_published() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/INN_Utlan_032024.xlsx")
            .with_status(404)
            .expect(1)
            .create();
        let url = format!("{}/INN_Utlan_032024.xlsx", server.url());
        assert_eq!(client(4).download(&url).unwrap(), None);
        mock.assert();
    }

    #[test]
    fn other_status_is_an_error_without_retry() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/INN_Utlan_032024.xlsx")
            .with_status(403)
            .expect(1)
            .create();
        let url = format!("{}/INN_Utlan_032024.xlsx", server.url());
        let res = client(4).download(&url);
        assert!(matches!(
            res,
            Err(FetchError::Status { status, .. }) if status == StatusCode::FORBIDDEN
        ));
        mock.assert();
    }

    #[test]
    fn unavailable_is_retried() {
        let mut server = mockito::Server::new();
        let unavailable = server
            .mock("GET", "/cal.ics")
            .with_status(503)
            .expect(1)
            .create();
        let ok = server
            .mock("GET", "/cal.ics")
            .with_status(200)
            .with_body("BEGIN:VCALENDAR")
            .expect(1)
            .create();
        let url = format!("{}/cal.ics", server.url());
        let body = client(3).download(&url).unwrap();
        assert_eq!(body, Some(b"BEGIN:VCALENDAR".to_vec()));
        unavailable.assert();
        ok.assert();
    }

    #[test]
    fn unavailable_until_out_of_attempts() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/cal.ics")
            .with_status(503)
            .expect(2)
            .create();
        let url = format!("{}/cal.ics", server.url());
        let res = client(2).download(&url);
        assert!(matches!(
            res,
            Err(FetchError::Status { status, .. }) if status == StatusCode::SERVICE_UNAVAILABLE
        ));
        mock.assert();
    }

    #[test]
    fn server_errors_are_transient() {
        let err = FetchError::Status {
            url: "https://x.is".to_string(),
            status: StatusCode::BAD_GATEWAY,
        };
        assert!(err.is_transient());
        let err = FetchError::Status {
            url: "https://x.is".to_string(),
            status: StatusCode::FORBIDDEN,
        };
        assert!(!err.is_transient());
    }
}
