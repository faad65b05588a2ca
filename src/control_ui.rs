//! Bootstrap snippet for the gateway's browser control UI.
//!
//! Nobody is present to paste the gateway token into the control UI of a
//! headless deployment. The snippet fetches it from the gated setup API,
//! stores it where the UI looks for it and fills any token input.

use hyper::header::{HeaderMap, CONTENT_TYPE};
use hyper::Method;

/// Paths that serve the control UI shell
pub const CONTROL_UI_PATHS: [&str; 3] = ["/", "/openclaw", "/openclaw/"];

pub const BOOTSTRAP_SCRIPT: &str = r#"
<script data-auto-token>
(function(){
  fetch("/setup/api/gateway-token", { credentials: "same-origin" })
    .then(function(r){ return r.ok ? r.json() : Promise.reject(new Error("auth required")); })
    .then(function(data){ var TOKEN = data.token; if (!TOKEN) return;

  function applyToken() {
    try {
      var keys = ["gateway-token", "gatewayToken", "openclaw-token", "token", "oc:gateway-token", "oc:token", "openclaw-gateway-token"];
      for (var i = 0; i < keys.length; i++) localStorage.setItem(keys[i], TOKEN);
    } catch(e) {}
    try {
      document.cookie = "token=" + TOKEN + "; path=/; SameSite=Lax";
      document.cookie = "gateway-token=" + TOKEN + "; path=/; SameSite=Lax";
    } catch(e) {}
  }
  applyToken();

  var nativeSetter = Object.getOwnPropertyDescriptor(HTMLInputElement.prototype, "value").set;
  function fill() {
    var inputs = document.querySelectorAll("input");
    var filled = false;
    for (var j = 0; j < inputs.length; j++) {
      var el = inputs[j];
      var ctx = "";
      var parent = el.closest("label, [class*=field], [class*=form-group]");
      if (parent) ctx += " " + parent.textContent.toLowerCase();
      var prev = el.previousElementSibling;
      if (prev) ctx += " " + prev.textContent.toLowerCase();
      ctx += " " + (el.placeholder || "").toLowerCase() + " " + (el.getAttribute("aria-label") || "").toLowerCase();
      var val = (el.value || "").trim();
      var isTokenField = ctx.includes("token") && !ctx.includes("session") && !ctx.includes("url") && !ctx.includes("password") && !ctx.includes("websocket");
      if (val === "OPENCLAW_GATEWAY_TOKEN") isTokenField = true;
      if (isTokenField) {
        if (val !== TOKEN) {
          nativeSetter.call(el, TOKEN);
          el.dispatchEvent(new Event("input", {bubbles:true}));
          el.dispatchEvent(new Event("change", {bubbles:true}));
          filled = true;
        }
        try { el.setAttribute("type", "password"); } catch(e) {}
      }
    }
    if (filled) {
      var btns = document.querySelectorAll("button");
      for (var k = 0; k < btns.length; k++) {
        if (btns[k].textContent.trim().toLowerCase() === "connect") {
          var btn = btns[k];
          setTimeout(function(){ btn.click(); }, 500);
          break;
        }
      }
    }
    return filled;
  }
  function tryFill() {
    if (!fill()) {
      var obs = new MutationObserver(function(){ if (fill()) obs.disconnect(); });
      obs.observe(document.documentElement, {childList:true, subtree:true});
      setTimeout(function(){ obs.disconnect(); }, 20000);
    }
  }
  if (document.readyState === "loading") {
    document.addEventListener("DOMContentLoaded", tryFill);
  } else {
    tryFill();
  }
  var applyCount = 0;
  var interval = setInterval(function(){
    applyToken();
    fill();
    if (++applyCount >= 24) clearInterval(interval);
  }, 500);
  }).catch(function(){});
})();
</script>"#;

/// Whether a request may receive the rewritten control UI
pub fn is_control_ui_request(method: &Method, path: &str) -> bool {
    *method == Method::GET && CONTROL_UI_PATHS.contains(&path)
}

pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

/// Insert the snippet before `</head>`, else before `</body>`, else at the end
pub fn inject_bootstrap(html: &str) -> String {
    if html.contains("data-auto-token") {
        return html.to_string();
    }
    for marker in ["</head>", "</body>"] {
        if let Some(pos) = html.find(marker) {
            let mut out = String::with_capacity(html.len() + BOOTSTRAP_SCRIPT.len() + 1);
            out.push_str(&html[..pos]);
            out.push_str(BOOTSTRAP_SCRIPT);
            out.push('\n');
            out.push_str(&html[pos..]);
            return out;
        }
    }
    format!("{html}{BOOTSTRAP_SCRIPT}")
}
