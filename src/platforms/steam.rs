//! Steam trade offer integration.
//!
//! Sends and declines offers through the community web endpoints (cookie
//! session), reads inventories from the community inventory endpoint, and
//! polls offer state through the `IEconService` Web API.
//!
//! Community base: https://steamcommunity.com
//! Web API base:   https://api.steampowered.com
//! Auth: `steamLoginSecure` cookie (web endpoints) + Web API key (polling).
//! The login cookie is supplied from outside; this client never logs in.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{HeaderMap, COOKIE, REFERER, SET_COOKIE};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info, warn};

use super::TradePlatform;
use crate::types::{
    AccountLimitations, AssetRef, InventoryItem, OfferSnapshot, OfferState, OfferSummary,
    OutgoingOffer, PlatformError, SentOffer,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const COMMUNITY_URL: &str = "https://steamcommunity.com";
const API_URL: &str = "https://api.steampowered.com";
const PLATFORM_NAME: &str = "steam";

/// SteamID64 of account id 0 in the public universe.
const STEAM_ID64_BASE: u64 = 76_561_197_960_265_728;

/// Inventory page size (community endpoint max).
const INVENTORY_PAGE: u32 = 2000;

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    tradeofferid: Option<String>,
    #[serde(default)]
    needs_mobile_confirmation: bool,
    #[serde(default)]
    needs_email_confirmation: bool,
    #[serde(default, rename = "strError")]
    str_error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientJsToken {
    #[serde(default)]
    logged_in: bool,
}

#[derive(Debug, Deserialize)]
struct InventoryResponse {
    #[serde(default)]
    assets: Vec<InventoryAsset>,
    #[serde(default)]
    descriptions: Vec<InventoryDescription>,
    #[serde(default)]
    more_items: Option<u8>,
    #[serde(default)]
    last_assetid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InventoryAsset {
    appid: u32,
    contextid: String,
    assetid: String,
    classid: String,
    instanceid: String,
    amount: String,
}

#[derive(Debug, Deserialize)]
struct InventoryDescription {
    classid: String,
    instanceid: String,
    market_hash_name: String,
    #[serde(default)]
    tradable: u8,
}

#[derive(Debug, Deserialize)]
struct TradeOffersEnvelope {
    response: TradeOffersResponse,
}

#[derive(Debug, Deserialize, Default)]
struct TradeOffersResponse {
    #[serde(default)]
    trade_offers_sent: Vec<ApiOffer>,
    #[serde(default)]
    trade_offers_received: Vec<ApiOffer>,
}

#[derive(Debug, Deserialize)]
struct ApiOffer {
    tradeofferid: String,
    accountid_other: u64,
    trade_offer_state: u8,
    #[serde(default)]
    time_updated: i64,
}

#[derive(Debug, Deserialize)]
struct PlayerBansEnvelope {
    players: Vec<PlayerBans>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PlayerBans {
    community_banned: bool,
    economy_ban: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Steam trade offer client.
pub struct SteamClient {
    http: Client,
    /// The agent's own SteamID64.
    steam_id: String,
    api_key: SecretString,
    login_cookie: SecretString,
    session_id: RwLock<Option<String>>,
}

impl SteamClient {
    pub fn new(steam_id: String, api_key: SecretString, login_cookie: SecretString) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("OFFERKEEPER/0.1.0 (trade-offer-agent)")
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build HTTP client for Steam")?;

        Ok(Self {
            http,
            steam_id,
            api_key,
            login_cookie,
            session_id: RwLock::new(None),
        })
    }

    // -- Session -----------------------------------------------------------

    fn current_session(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Get the session id, refreshing if we have none yet.
    async fn ensure_session(&self) -> Result<String, PlatformError> {
        if let Some(session) = self.current_session() {
            return Ok(session);
        }
        self.refresh_session().await?;
        self.current_session().ok_or(PlatformError::SessionExpired)
    }

    fn cookie_header(&self, session_id: &str) -> String {
        format!(
            "steamLoginSecure={}; sessionid={session_id}",
            self.login_cookie.expose_secret()
        )
    }

    // -- Helpers -----------------------------------------------------------

    /// Map non-success responses to platform errors, keeping the code.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(PlatformError::SessionExpired);
        }
        let body = resp.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), body = %body, "Steam returned an error response");
        Err(PlatformError::Http {
            status: status.as_u16(),
            body,
        })
    }

    async fn load_inventory_page(
        &self,
        app_id: u32,
        context_id: u64,
        start_after: Option<&str>,
    ) -> Result<InventoryResponse, PlatformError> {
        let mut url = format!(
            "{COMMUNITY_URL}/inventory/{}/{app_id}/{context_id}?l=english&count={INVENTORY_PAGE}",
            self.steam_id
        );
        if let Some(asset) = start_after {
            url.push_str(&format!("&start_assetid={}", urlencoding::encode(asset)));
        }

        debug!(url = %url, "Fetching inventory page");
        let session = self.ensure_session().await?;
        let resp = self
            .http
            .get(&url)
            .header(COOKIE, self.cookie_header(&session))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }
}

/// Convert a SteamID64 to the 32-bit account id used in trade URLs.
pub fn account_id(steam_id64: &str) -> Result<u32, PlatformError> {
    let id: u64 = steam_id64
        .parse()
        .map_err(|_| PlatformError::Decode(format!("invalid SteamID64: {steam_id64}")))?;
    id.checked_sub(STEAM_ID64_BASE)
        .and_then(|account| u32::try_from(account).ok())
        .ok_or_else(|| PlatformError::Decode(format!("SteamID64 out of range: {steam_id64}")))
}

fn steam_id64(account_id: u64) -> String {
    (STEAM_ID64_BASE + account_id).to_string()
}

/// The `json_tradeoffer` form field.
fn offer_payload(offer: &OutgoingOffer) -> serde_json::Value {
    fn side(items: &[AssetRef]) -> serde_json::Value {
        serde_json::json!({
            "assets": items,
            "currency": [],
            "ready": false,
        })
    }

    serde_json::json!({
        "newversion": true,
        "version": offer.my_items.len() + offer.their_items.len() + 1,
        "me": side(&offer.my_items),
        "them": side(&offer.their_items),
    })
}

/// Pull `sessionid` out of `Set-Cookie` headers.
fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.trim().strip_prefix("sessionid="))
        .map(str::to_string)
        .find(|value| !value.is_empty())
}

/// Join inventory assets to their descriptions.
fn join_inventory(page: InventoryResponse, tradable_only: bool) -> Vec<InventoryItem> {
    let descriptions: HashMap<(String, String), InventoryDescription> = page
        .descriptions
        .into_iter()
        .map(|d| ((d.classid.clone(), d.instanceid.clone()), d))
        .collect();

    page.assets
        .into_iter()
        .filter_map(|asset| {
            let description = descriptions.get(&(asset.classid.clone(), asset.instanceid.clone()))?;
            let tradable = description.tradable == 1;
            if tradable_only && !tradable {
                return None;
            }
            Some(InventoryItem {
                assetid: asset.assetid,
                appid: asset.appid,
                contextid: asset.contextid,
                amount: asset.amount.parse().unwrap_or(1),
                market_hash_name: description.market_hash_name.clone(),
                tradable,
            })
        })
        .collect()
}

/// Map GetPlayerBans onto the limits the agent checks at startup.
///
/// The Web API has no trade-lock field, so this is an approximation: an
/// economy ban (`"banned"`) counts as locked, while a `"probation"` ban and
/// the limited-account and friend-invite restrictions (which Steam only
/// shows on the community profile page) are not detected. `limited` is
/// always `false` and `can_invite_friends` always `true`.
fn limitations_from_bans(bans: &PlayerBans) -> AccountLimitations {
    AccountLimitations {
        limited: false,
        community_banned: bans.community_banned,
        locked: bans.economy_ban == "banned",
        can_invite_friends: true,
    }
}

fn summarize(offers: Vec<ApiOffer>) -> Vec<OfferSummary> {
    offers
        .into_iter()
        .filter_map(|offer| {
            let Some(state) = OfferState::from_code(offer.trade_offer_state) else {
                warn!(
                    offer_id = %offer.tradeofferid,
                    code = offer.trade_offer_state,
                    "Unknown trade offer state, skipping"
                );
                return None;
            };
            Some(OfferSummary {
                id: offer.tradeofferid,
                partner: steam_id64(offer.accountid_other),
                state,
                updated_at: offer.time_updated,
            })
        })
        .collect()
}

#[async_trait]
impl TradePlatform for SteamClient {
    async fn send_offer(&self, offer: &OutgoingOffer) -> Result<SentOffer, PlatformError> {
        let session = self.ensure_session().await?;
        let partner_account = account_id(&offer.partner)?;

        let mut referer = format!("{COMMUNITY_URL}/tradeoffer/new/?partner={partner_account}");
        let mut create_params = serde_json::json!({});
        if let Some(token) = &offer.trade_token {
            referer.push_str(&format!("&token={}", urlencoding::encode(token)));
            create_params = serde_json::json!({ "trade_offer_access_token": token });
        }

        let form = [
            ("sessionid", session.clone()),
            ("serverid", "1".to_string()),
            ("partner", offer.partner.clone()),
            ("tradeoffermessage", offer.message.clone()),
            ("json_tradeoffer", offer_payload(offer).to_string()),
            ("captcha", String::new()),
            ("trade_offer_create_params", create_params.to_string()),
        ];

        let resp = self
            .http
            .post(format!("{COMMUNITY_URL}/tradeoffer/new/send"))
            .header(COOKIE, self.cookie_header(&session))
            .header(REFERER, referer)
            .form(&form)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(PlatformError::SessionExpired);
        }
        let body = resp.text().await?;

        // Steam reports send failures as a 500 with `strError` in the body.
        let parsed: Option<SendResponse> = serde_json::from_str(&body).ok();
        match parsed {
            Some(SendResponse {
                tradeofferid: Some(id),
                needs_mobile_confirmation,
                needs_email_confirmation,
                ..
            }) => {
                let status = if needs_mobile_confirmation || needs_email_confirmation {
                    "pending"
                } else {
                    "sent"
                };
                info!(offer_id = %id, partner = %offer.partner, status, "Trade offer sent");
                Ok(SentOffer {
                    id,
                    status: status.to_string(),
                })
            }
            Some(SendResponse {
                str_error: Some(message),
                ..
            }) => Err(PlatformError::Rejected(message)),
            _ => Err(PlatformError::Http {
                status: status.as_u16(),
                body,
            }),
        }
    }

    async fn decline_offer(&self, offer_id: &str) -> Result<(), PlatformError> {
        let session = self.ensure_session().await?;
        let resp = self
            .http
            .post(format!("{COMMUNITY_URL}/tradeoffer/{offer_id}/decline"))
            .header(COOKIE, self.cookie_header(&session))
            .form(&[("sessionid", session.as_str())])
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn load_inventory(
        &self,
        app_id: u32,
        context_id: u64,
        tradable_only: bool,
    ) -> Result<Vec<InventoryItem>, PlatformError> {
        let mut items = Vec::new();
        let mut start_after: Option<String> = None;

        loop {
            let page = self
                .load_inventory_page(app_id, context_id, start_after.as_deref())
                .await?;
            let more = page.more_items == Some(1);
            let last = page.last_assetid.clone();
            items.extend(join_inventory(page, tradable_only));

            match (more, last) {
                (true, Some(last)) => start_after = Some(last),
                _ => break,
            }
        }

        debug!(count = items.len(), app_id, context_id, "Inventory loaded");
        Ok(items)
    }

    async fn poll_offers(&self, cutoff: i64) -> Result<OfferSnapshot, PlatformError> {
        let url = format!(
            "{API_URL}/IEconService/GetTradeOffers/v1/?key={}&get_sent_offers=1&get_received_offers=1&active_only=1&time_historical_cutoff={cutoff}",
            urlencoding::encode(self.api_key.expose_secret()),
        );

        let resp = self.http.get(&url).send().await?;
        let resp = Self::check(resp).await?;
        let envelope: TradeOffersEnvelope = resp.json().await?;

        Ok(OfferSnapshot {
            sent: summarize(envelope.response.trade_offers_sent),
            received: summarize(envelope.response.trade_offers_received),
        })
    }

    async fn refresh_session(&self) -> Result<(), PlatformError> {
        info!("Refreshing Steam web session...");

        let resp = self
            .http
            .get(format!("{COMMUNITY_URL}/chat/clientjstoken"))
            .header(COOKIE, format!("steamLoginSecure={}", self.login_cookie.expose_secret()))
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        // Steam accepts any sessionid as long as cookie and form agree.
        let session = session_from_headers(resp.headers()).unwrap_or_else(|| {
            let bytes: [u8; 12] = rand::thread_rng().gen();
            bytes.iter().map(|b| format!("{b:02x}")).collect()
        });

        let token: ClientJsToken = resp.json().await?;
        if !token.logged_in {
            return Err(PlatformError::SessionExpired);
        }

        *self
            .session_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session);

        info!("Steam web session established");
        Ok(())
    }

    /// Derived from `GetPlayerBans`; only an economy ban is seen as a trade
    /// lock. See [`limitations_from_bans`].
    async fn account_limitations(&self) -> Result<AccountLimitations, PlatformError> {
        let url = format!(
            "{API_URL}/ISteamUser/GetPlayerBans/v1/?key={}&steamids={}",
            urlencoding::encode(self.api_key.expose_secret()),
            self.steam_id,
        );
        let resp = self.http.get(&url).send().await?;
        let resp = Self::check(resp).await?;
        let envelope: PlayerBansEnvelope = resp.json().await?;

        let bans = envelope
            .players
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::Decode("GetPlayerBans returned no players".into()))?;

        Ok(limitations_from_bans(&bans))
    }

    fn name(&self) -> &str {
        PLATFORM_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
