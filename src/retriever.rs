//! Keyword-triggered lookups into the static knowledge bases.
//!
//! Each domain is a table of rules. A rule fires when any of its keywords is a
//! substring of the (already normalized) caller utterance, and every firing
//! rule contributes its payload. Payloads are emitted in [`Category`] order, not
//! table order.

/// Which knowledge base a call draws from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Domain {
    /// Outbound cold calls
    Sales,
    /// Inbound receptionist calls
    Reception,
}

impl Domain {
    fn min_chars(self) -> usize {
        match self {
            Domain::Sales => 10,
            Domain::Reception => 5,
        }
    }

    fn ignored_phrases(self) -> &'static [&'static str] {
        match self {
            Domain::Sales => &["dobrý den", "ahoj", "dobry den", "slyšíme se"],
            Domain::Reception => &[],
        }
    }

    fn rules(self) -> &'static [Rule] {
        match self {
            Domain::Sales => SALES_RULES,
            Domain::Reception => RECEPTION_RULES,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Category {
    Price,
    Timing,
    Services,
    Opportunity,
    Objection,
    Location,
}

#[derive(Debug)]
pub struct Rule {
    pub category: Category,
    pub keywords: &'static [&'static str],
    pub payload: &'static str,
    /// The caller refused outright; the call should wind down.
    pub hard_rejection: bool,
}

impl Rule {
    fn matches(&self, text: &str) -> bool {
        self.keywords.iter().any(|k| text.contains(k))
    }
}

const SALES_RULES: &[Rule] = &[
    Rule {
        category: Category::Price,
        keywords: &["kolik stojí", "cena", "kolik to", "za kolik", "platit"],
        payload: "CENÍK:\n- One-page web: 8 000 Kč\n- Vícestránkový web: 12 000 Kč\n- Personalizované řešení: od 12 000 Kč",
        hard_rejection: false,
    },
    Rule {
        category: Category::Timing,
        keywords: &["jak dlouho", "kdy", "trvá", "termín"],
        payload: "REALIZACE: 2-4 týdny",
        hard_rejection: false,
    },
    Rule {
        category: Category::Services,
        keywords: &["co nabízíte", "co děláte", "jaké služby"],
        payload: "SLUŽBY:\n- Weby na míru (ruční kódování)\n- SEO optimalizace\n- Rychlost a výkon",
        hard_rejection: false,
    },
    Rule {
        category: Category::Opportunity,
        keywords: &["nemáme web", "nemám web", "starý web", "zastaralý", "nefunguje"],
        payload: "PŘÍLEŽITOST: zákazník nemá web nebo má špatný web.\nAKCE: navrhni schůzku.",
        hard_rejection: false,
    },
    Rule {
        category: Category::Objection,
        keywords: &["drahé", "nemám peníze"],
        payload: "NÁMITKA: Chápu. Web od 8 tisíc je ale investice, která se vrátí už prvními zákazníky.",
        hard_rejection: false,
    },
    Rule {
        category: Category::Objection,
        keywords: &["nemám čas", "teď ne", "spěchám"],
        payload: "NÁMITKA: Chápu, že jste vytížený. Stačí dvě minuty, nebo můžu zavolat jindy?",
        hard_rejection: false,
    },
    Rule {
        category: Category::Objection,
        keywords: &["nemám zájem", "nechci"],
        payload: "TVRDÉ ODMÍTNUTÍ: poděkuj za čas a rozluč se.",
        hard_rejection: true,
    },
];

const RECEPTION_RULES: &[Rule] = &[
    Rule {
        category: Category::Price,
        keywords: &["cena", "kolik", "stojí", "služby"],
        payload: "CENÍK SLUŽEB:\n- Pánský střih: 350 Kč (30 min)\n- Dámský střih: 400 Kč (40 min)\n- Dětský střih: 250 Kč (20 min)\n- Holení: 250 Kč (20 min)\n- Vousy: 200 Kč (15 min)\n- Komplet: 700 Kč (60 min)",
        hard_rejection: false,
    },
    Rule {
        category: Category::Timing,
        keywords: &["objednat", "termín", "rezervace", "volno"],
        payload: "REZERVACE:\nTelefon: +420 735 744 433\nOnline: www.barbershop.cz/rezervace\nAKCE: nabídni konkrétní časy (14:00, 15:30, 17:00)",
        hard_rejection: false,
    },
    Rule {
        category: Category::Timing,
        keywords: &["otevřeno", "otevírací", "zavřeno"],
        payload: "OTEVÍRACÍ DOBA:\nPo-Pá: 9:00-19:00\nSobota: 9:00-15:00\nNeděle: zavřeno",
        hard_rejection: false,
    },
    Rule {
        category: Category::Timing,
        keywords: &["zrušit termín", "přesunout termín", "změnit", "zrušit", "storno"],
        payload: "STORNO: zdarma při zrušení min. 3 hodiny předem\nAKCE: zeptej se, na jaké jméno je rezervace",
        hard_rejection: false,
    },
    Rule {
        category: Category::Timing,
        keywords: &["bez objednání", "bez objednávky", "bez rezervace"],
        payload: "BEZ OBJEDNÁNÍ: ano, ale doporuč rezervaci, aby byl termín zaručený",
        hard_rejection: false,
    },
    Rule {
        category: Category::Services,
        keywords: &["co nabízíte", "jaké služby", "co děláte"],
        payload: "SLUŽBY: stříhání pánské, dámské a dětské, holení břitvou, úprava vousů, barvení",
        hard_rejection: false,
    },
    Rule {
        category: Category::Services,
        keywords: &["zaplatit", "platba", "platit", "kartou", "hotově"],
        payload: "PLATBA: hotově, kartou, Apple Pay nebo Google Pay",
        hard_rejection: false,
    },
    Rule {
        category: Category::Services,
        keywords: &["první návštěv", "poprvé", "co potřebuji"],
        payload: "PRVNÍ NÁVŠTĚVA: nic speciálního není potřeba, stačí přijít",
        hard_rejection: false,
    },
    Rule {
        category: Category::Location,
        keywords: &["kde", "adresa", "najdu", "dostanu"],
        payload: "ADRESA: Hlavní 123, Praha 1\nParkování: za rohem nebo na Hlavní ulici",
        hard_rejection: false,
    },
    Rule {
        category: Category::Location,
        keywords: &["zaparkuj", "parkování", "parkoviště", "parkovat"],
        payload: "PARKOVÁNÍ: parkoviště za rohem nebo veřejné parkování na Hlavní ulici",
        hard_rejection: false,
    },
];

fn matching_rules(text: &str, domain: Domain) -> Vec<&'static Rule> {
    let text = text.trim().to_lowercase();
    if text.chars().count() < domain.min_chars() || domain.ignored_phrases().contains(&text.as_str())
    {
        return vec![];
    }
    let mut rules: Vec<&'static Rule> = domain.rules().iter().filter(|r| r.matches(&text)).collect();
    rules.sort_by_key(|r| r.category);
    rules
}

/// Supplemental grounding text for the next model call, empty when nothing
/// applies.
pub fn retrieve(normalized: &str, domain: Domain) -> String {
    matching_rules(normalized, domain)
        .iter()
        .map(|r| r.payload)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Unlike [`retrieve`], ignores the minimum length: a bare "nechci" still
/// ends the call.
pub fn is_hard_rejection(normalized: &str, domain: Domain) -> bool {
    let text = normalized.trim().to_lowercase();
    domain
        .rules()
        .iter()
        .any(|r| r.hard_rejection && r.matches(&text))
}
