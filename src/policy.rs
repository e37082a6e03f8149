//! Allow-list policy: the only authorization gate of the agent.
//!
//! A command is accepted when its first whitespace-separated token,
//! stripped of any path prefix, is an allow-listed tool name.
//!
//! Known gap: nothing after the first token is inspected. Arguments,
//! pipes, redirections and chained commands (`ls; rm -rf ~`) all pass
//! as long as the first word is allowed, and the full string is later
//! handed to a shell.

use std::collections::HashSet;

/// Tools permitted when the config does not provide its own list.
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "nmap", "masscan", "nikto", "nuclei", "hydra", "john", "hashcat",
    "sqlmap", "gobuster", "dirb", "wfuzz", "ffuf", "netcat", "nc",
    "curl", "wget", "whois", "dig", "host", "traceroute", "ping",
    "arp-scan", "netdiscover", "enum4linux", "smbclient", "rpcclient",
    "snort", "suricata", "tcpdump", "wireshark", "tshark", "lynis",
    "openvas", "clamav", "clamscan", "yara", "volatility", "binwalk",
    "strings", "file", "hexdump", "xxd", "base64", "md5sum", "sha256sum",
    "searchsploit", "msfconsole", "msfvenom", "setoolkit",
    "airmon-ng", "airodump-ng", "aireplay-ng", "aircrack-ng",
    "wpscan", "whatweb", "wafw00f", "fierce", "dnsrecon", "sublist3r",
    "theHarvester", "recon-ng", "maltego", "shodan", "censys",
    "burpsuite", "zap", "skipfish", "w3af", "arachni", "vega",
    "metasploit", "armitage", "cobalt", "empire", "powershell",
    "responder", "impacket", "crackmapexec", "evil-winrm", "bloodhound",
    "cat", "ls", "pwd", "id", "whoami", "uname", "ifconfig", "ip",
    "echo", "grep", "awk", "sed", "cut", "sort", "uniq", "wc", "head", "tail",
];

/// Number of tool names shown in a rejection message.
const PREVIEW_LEN: usize = 10;

/// Immutable allow-list, built once at startup.
#[derive(Debug, Clone)]
pub struct PolicyValidator {
    /// Tool names in configuration order (reported by `/health`).
    tools: Vec<String>,
    index: HashSet<String>,
}

impl PolicyValidator {
    pub fn new<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut index = HashSet::new();
        let mut ordered = Vec::new();
        for tool in tools {
            let tool = tool.into();
            if index.insert(tool.clone()) {
                ordered.push(tool);
            }
        }
        Self {
            tools: ordered,
            index,
        }
    }

    /// Returns true if the command's base executable is allow-listed.
    pub fn check(&self, command: &str) -> bool {
        base_command(command).is_some_and(|base| self.index.contains(base))
    }

    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Short, human-readable excerpt of the list for error messages.
    pub fn preview(&self) -> String {
        let head: Vec<&str> = self
            .tools
            .iter()
            .take(PREVIEW_LEN)
            .map(String::as_str)
            .collect();
        if self.tools.len() > PREVIEW_LEN {
            format!("{}...", head.join(", "))
        } else {
            head.join(", ")
        }
    }
}

impl Default for PolicyValidator {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_TOOLS.iter().copied())
    }
}

/// Extracts the executable name checked by the policy: the first
/// whitespace-separated token, keeping only its final path segment.
///
/// Returns `None` for an empty or whitespace-only command.
pub fn base_command(command: &str) -> Option<&str> {
    let first = command.split_whitespace().next()?;
    first.rsplit('/').next()
}
