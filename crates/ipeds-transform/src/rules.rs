use ipeds_core::ColumnKind::{Decimal, Integer, Text};

use crate::{Predicate, RuleSet};

const UNITID: &str = "UNITID";

/// Rule set for a catalog key, `None` for datasets that are only fetched.
pub fn rule_set_for(dataset_key: &str) -> Option<RuleSet> {
    let rules = match dataset_key {
        "institutions" => institutions(),
        "institutional_characteristics" => institutional_characteristics(),
        "institutional_characteristics_ay" => tuition_fees(),
        "enrollment_fall" => enrollment_fall(),
        "staff_instructional" => staff_instructional(),
        "finance_public" => finance_public(),
        "completions" => completions(),
        "admissions" => admissions(),
        "graduation_rates" => graduation_rates(),
        "graduation_rates_pell" => graduation_rates_pell(),
        "salaries_instructional" => faculty_salaries(),
        "financial_aid_summary" => financial_aid(),
        "outcome_measures" => outcome_measures(),
        "academic_libraries" => academic_libraries(),
        _ => return None,
    };
    Some(rules)
}

pub fn builtin_rule_sets() -> Vec<RuleSet> {
    [
        "institutions",
        "institutional_characteristics",
        "institutional_characteristics_ay",
        "enrollment_fall",
        "staff_instructional",
        "finance_public",
        "completions",
        "admissions",
        "graduation_rates",
        "graduation_rates_pell",
        "salaries_instructional",
        "financial_aid_summary",
        "outcome_measures",
        "academic_libraries",
    ]
    .into_iter()
    .filter_map(rule_set_for)
    .collect()
}

fn by_unitid(rules: RuleSet) -> RuleSet {
    rules.key(UNITID, "unitid", Integer)
}

fn institutions() -> RuleSet {
    by_unitid(RuleSet::direct("institutions", "ipeds_institutions"))
        .text("INSTNM", "institution_name")
        .text("IALIAS", "institution_alias")
        .text("ADDR", "address")
        .text("CITY", "city")
        .text("STABBR", "state")
        .text("ZIP", "zip")
        .text("WEBADDR", "website")
        .int("SECTOR", "sector")
        .int("ICLEVEL", "institutional_level")
        .int("CONTROL", "control")
        .int("HBCU", "historically_black")
        .int("HOSPITAL", "has_hospital")
        .int("MEDICAL", "has_medical_school")
        .int("TRIBAL", "tribal_college")
        .int("LANDGRNT", "landgrant")
        .int("CCBASIC", "carnegie_classification")
        .int("LOCALE", "locale")
        .int("INSTSIZE", "institution_size")
        .text("CBSA", "metro_area")
        .text("COUNTYNM", "county_name")
        .int("OBEREG", "geographic_region")
        .dec("LATITUDE", "latitude")
        .dec("LONGITUD", "longitude")
        .int("F1SYSTYP", "system_type")
        .text("F1SYSNAM", "system_name")
}

fn institutional_characteristics() -> RuleSet {
    by_unitid(RuleSet::direct(
        "institutional_characteristics",
        "ipeds_institutional_characteristics",
    ))
    .int("OPENADMP", "open_admission")
    .int("CREDITS1", "credit_life_experience")
    .int("CREDITS2", "credit_exam")
    .int("CREDITS3", "credit_military")
    .int("CREDITS4", "credit_online")
    .int("SLO5", "student_learning_outcomes")
    .int("SLO7", "learning_assessment")
    .int("CALSYS", "calendar_system")
    .int("YRSCOLL", "years_college_required")
    .dec("APPLFEEU", "undergrad_application_fee")
    .dec("APPLFEEG", "grad_application_fee")
    .int("ROOM", "room_offered")
    .int("BOARD", "board_offered")
    .int("ROOMCAP", "room_capacity")
    .int("BOARDCAP", "board_capacity")
    .dec("ROOMAMT", "room_charge")
    .dec("BOARDAMT", "board_charge")
}

fn tuition_fees() -> RuleSet {
    by_unitid(RuleSet::direct(
        "institutional_characteristics_ay",
        "ipeds_tuition_fees",
    ))
    .dec("TUITION1", "tuition_in_district")
    .dec("TUITION2", "tuition_in_state")
    .dec("TUITION3", "tuition_out_of_state")
    .dec("FEE1", "fees_in_district")
    .dec("FEE2", "fees_in_state")
    .dec("FEE3", "fees_out_of_state")
    .dec("HRCHG1", "per_credit_in_district")
    .dec("HRCHG2", "per_credit_in_state")
    .dec("HRCHG3", "per_credit_out_of_state")
    .dec("TUITION5", "grad_tuition_in_state")
    .dec("TUITION6", "grad_tuition_out_of_state")
    .dec("FEE5", "grad_fees_in_state")
    .dec("FEE6", "grad_fees_out_of_state")
}

/// EFALEVEL 1 is all students, 2 all undergraduates, 4 all graduate students.
fn enrollment_fall() -> RuleSet {
    let all = || Predicate::equals("EFALEVEL", "1");
    let mut rules = by_unitid(RuleSet::pivot("enrollment_fall", "ipeds_enrollment"))
        .column_when("EFTOTLT", "total_enrollment", Integer, all())
        .column_when("EFTOTLM", "enrollment_men", Integer, all())
        .column_when("EFTOTLW", "enrollment_women", Integer, all());
    for (source, field) in [
        ("EFAIANT", "enrollment_american_indian"),
        ("EFASIAT", "enrollment_asian"),
        ("EFBKAAT", "enrollment_black"),
        ("EFHISPT", "enrollment_hispanic"),
        ("EFWHITT", "enrollment_white"),
        ("EF2MORT", "enrollment_two_or_more"),
        ("EFNRALT", "enrollment_nonresident"),
    ] {
        rules = rules.column_when(source, field, Integer, all());
    }
    rules
        .column_when(
            "EFTOTLT",
            "undergraduate_total",
            Integer,
            Predicate::equals("EFALEVEL", "2"),
        )
        .column_when(
            "EFTOTLT",
            "graduate_total",
            Integer,
            Predicate::equals("EFALEVEL", "4"),
        )
}

/// Instructional staff counts keyed by SISCAT/FACSTAT/ARANK category codes.
fn staff_instructional() -> RuleSet {
    let category = |siscat: &str, facstat: &str, arank: &str| {
        Predicate::equals("SISCAT", siscat)
            .and("FACSTAT", facstat)
            .and("ARANK", arank)
    };
    by_unitid(RuleSet::pivot("staff_instructional", "ipeds_staff"))
        .column_when(
            "HRTOTLT",
            "instructional_staff_total",
            Integer,
            category("100", "10", "0"),
        )
        .column_when(
            "HRTOTLM",
            "instructional_staff_men",
            Integer,
            category("100", "10", "0"),
        )
        .column_when(
            "HRTOTLW",
            "instructional_staff_women",
            Integer,
            category("100", "10", "0"),
        )
        .column_when("HRTOTLT", "tenured_faculty", Integer, category("200", "20", "0"))
        .column_when(
            "HRTOTLT",
            "tenure_track_faculty",
            Integer,
            category("300", "30", "0"),
        )
        .column_when("HRTOTLT", "professors", Integer, category("100", "10", "1"))
        .column_when(
            "HRTOTLT",
            "associate_professors",
            Integer,
            category("100", "10", "2"),
        )
        .column_when(
            "HRTOTLT",
            "assistant_professors",
            Integer,
            category("100", "10", "3"),
        )
}

fn finance_public() -> RuleSet {
    by_unitid(RuleSet::direct("finance_public", "ipeds_finance"))
        .dec("F2A01", "total_assets")
        .dec("F2C01", "total_revenues")
        .dec("F2D01", "total_expenses")
        .dec("F2D03", "research_total")
}

/// One input row per program and award level; degrees are counted per level.
fn completions() -> RuleSet {
    let level = |codes: &[&str]| Predicate::always().and_any("AWLEVEL", codes);
    by_unitid(RuleSet::pivot("completions", "ipeds_completions"))
        .count_when("total_degrees", Predicate::always())
        .count_when("associates_degrees", level(&["3"]))
        .count_when("bachelors_degrees", level(&["5"]))
        .count_when("masters_degrees", level(&["7"]))
        .count_when("doctoral_degrees", level(&["17", "19"]))
}

fn admissions() -> RuleSet {
    by_unitid(RuleSet::direct("admissions", "ipeds_admissions"))
        .int("APPLCN", "applicants")
        .int("ADMSSN", "admitted")
        .int("ENRLT", "enrolled")
        .int("SATMT25", "sat_math_25")
        .int("SATMT75", "sat_math_75")
        .int("ACTCM25", "act_composite_25")
        .int("ACTCM75", "act_composite_75")
        .ratio("acceptance_rate", "admitted", "applicants", 100.0, 2)
        .ratio("yield_rate", "enrolled", "admitted", 100.0, 2)
}

fn graduation_rates() -> RuleSet {
    by_unitid(RuleSet::direct("graduation_rates", "ipeds_graduation_rates"))
        .key("GRTYPE", "cohort_type", Integer)
        .int("GRCOHRT", "cohort_size")
        .int("GRTOTLT", "completers_total")
        .int("GRTOTLM", "completers_men")
        .int("GRTOTLW", "completers_women")
        .int("GRRACE15", "completers_nonresident")
        .int("GRRACE16", "completers_hispanic")
        .int("GRRACE17", "completers_american_indian")
        .int("GRRACE18", "completers_asian")
        .int("GRRACE19", "completers_black")
        .int("GRRACE20", "completers_hawaiian")
        .int("GRRACE21", "completers_white")
        .int("GRRACE22", "completers_two_or_more")
        .int("GRRACE23", "completers_unknown")
}

fn graduation_rates_pell() -> RuleSet {
    by_unitid(RuleSet::direct("graduation_rates_pell", "ipeds_graduation_pell"))
        .key("PGRTYPE", "cohort_type", Integer)
        .int("PGCOHRT", "pell_cohort_size")
        .int("PGTOTLT", "pell_completers_total")
        .int("PGTOTLM", "pell_completers_men")
        .int("PGTOTLW", "pell_completers_women")
        .int("SGCOHRT", "loan_cohort_size")
        .int("SGTOTLT", "loan_completers_total")
        .int("SGTOTLM", "loan_completers_men")
        .int("SGTOTLW", "loan_completers_women")
}

fn faculty_salaries() -> RuleSet {
    by_unitid(RuleSet::direct(
        "salaries_instructional",
        "ipeds_faculty_salaries",
    ))
    .key("ARANK", "academic_rank", Integer)
    .key("SALGEND", "gender", Integer)
    .int("SALTOTL", "faculty_count")
    .dec("SALARY", "average_salary")
}

fn financial_aid() -> RuleSet {
    by_unitid(RuleSet::direct("financial_aid_summary", "ipeds_financial_aid"))
        .int("SCUGRAD", "undergrads_total")
        .int("SCUGFFN", "fulltime_firsttime_total")
        .int("SCFA1N", "federal_grant_recipients")
        .dec("SCFA1P", "federal_grant_percent")
        .int("SCFA2N", "pell_recipients")
        .dec("SCFA2P", "pell_percent")
        .int("SCFA11N", "state_local_grant_recipients")
        .dec("SCFA11P", "state_local_grant_percent")
        .int("SCFA12N", "institutional_grant_recipients")
        .dec("SCFA12P", "institutional_grant_percent")
        .int("SCFA13N", "loan_recipients")
        .dec("SCFA13P", "loan_percent")
        .int("UAGRNTN", "grant_aid_recipients")
        .dec("UAGRNTP", "grant_aid_percent")
        .dec("UAGRNTA", "average_grant_amount")
        .int("ANYAIDN", "any_aid_recipients")
        .dec("ANYAIDP", "any_aid_percent")
}

fn outcome_measures() -> RuleSet {
    by_unitid(RuleSet::direct("outcome_measures", "ipeds_outcome_measures"))
        .int("OMCHRT", "outcome_cohort_size")
        .dec("OMAWDP8", "completed_8yr_percent")
        .int("OMAWDM8", "completed_8yr_men")
        .int("OMAWDW8", "completed_8yr_women")
        .dec("OMENRP8", "enrolled_8yr_percent")
        .int("OMENRM8", "enrolled_8yr_men")
        .int("OMENRW8", "enrolled_8yr_women")
        .dec("OMNRTP8", "neither_8yr_percent")
}

fn academic_libraries() -> RuleSet {
    by_unitid(RuleSet::direct("academic_libraries", "ipeds_academic_libraries"))
        .int("LSTBOOK", "books_physical")
        .int("LEBOOKS", "books_electronic")
        .int("LSERDL", "serials_digital")
        .int("LSERPR", "serials_print")
        .int("LDBASES", "databases")
        .int("LVIDEO", "video_materials")
        .int("LAUDIO", "audio_materials")
        .dec("LTOTEXP", "total_expenses")
        .dec("LSTEXP", "staff_expenses")
        .dec("LCOLEXP", "collection_expenses")
        .dec("LOPEXP", "operations_expenses")
        .dec("LSTFFTE", "librarian_fte")
        .int("LIBTOTH", "service_hours_per_year")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform;
    use ipeds_core::{Catalog, RawTable, Value};

    fn table(headers: &[&str], rows: &[&[&str]]) -> RawTable {
        RawTable::new(
            headers.iter().map(|h| h.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn every_builtin_rule_set_is_valid_and_cataloged() {
        let catalog = Catalog::builtin();
        let sets = builtin_rule_sets();
        assert_eq!(sets.len(), 14);
        for rules in sets {
            rules.validate().unwrap();
            assert!(catalog.contains(&rules.dataset_key), "{}", rules.dataset_key);
            assert!(rules.table.starts_with("ipeds_"));
        }
    }

    #[test]
    fn fetch_only_datasets_have_no_rules() {
        assert!(rule_set_for("institutional_mission").is_none());
        assert!(rule_set_for("enrollment_fall_age").is_none());
    }

    #[test]
    fn enrollment_levels_pivot_by_unitid() {
        let raw = table(
            &["UNITID", "EFALEVEL", "EFTOTLT", "EFTOTLM", "EFTOTLW"],
            &[
                &["100654", "1", "6106", "2508", "3598"],
                &["100654", "2", "5196", "2145", "3051"],
                &["100654", "4", "910", "363", "547"],
                &["100654", "12", "40", "10", "30"],
            ],
        );
        let out = transform(&raw, &rule_set_for("enrollment_fall").unwrap(), 2023).unwrap();
        assert_eq!(out.records.len(), 1);
        let record = &out.records[0];
        assert_eq!(record.get("total_enrollment"), Some(&Value::Integer(6106)));
        assert_eq!(record.get("enrollment_women"), Some(&Value::Integer(3598)));
        assert_eq!(record.get("undergraduate_total"), Some(&Value::Integer(5196)));
        assert_eq!(record.get("graduate_total"), Some(&Value::Integer(910)));
        assert_eq!(record.get("enrollment_asian"), Some(&Value::Null));
        assert!(out.missing_columns.contains(&"EFASIAT".to_string()));
    }

    #[test]
    fn staff_categories_stay_isolated() {
        let raw = table(
            &["UNITID", "SISCAT", "FACSTAT", "ARANK", "HRTOTLT"],
            &[
                &["1", "100", "10", "0", "900"],
                &["1", "200", "20", "0", "400"],
                &["1", "300", "30", "0", "150"],
                &["1", "100", "10", "1", "300"],
                &["1", "100", "40", "0", "77"],
            ],
        );
        let out = transform(&raw, &rule_set_for("staff_instructional").unwrap(), 2023).unwrap();
        let record = &out.records[0];
        assert_eq!(record.get("instructional_staff_total"), Some(&Value::Integer(900)));
        assert_eq!(record.get("tenured_faculty"), Some(&Value::Integer(400)));
        assert_eq!(record.get("tenure_track_faculty"), Some(&Value::Integer(150)));
        assert_eq!(record.get("professors"), Some(&Value::Integer(300)));
        assert_eq!(record.get("associate_professors"), Some(&Value::Null));
    }

    #[test]
    fn salaries_key_on_rank_and_gender() {
        let raw = table(
            &["UNITID", "ARANK", "SALGEND", "SALTOTL", "SALARY"],
            &[
                &["1", "1", "1", "10", "120000"],
                &["1", "1", "2", "8", "118000"],
                &["1", "2", "1", "12", "95000"],
            ],
        );
        let rules = rule_set_for("salaries_instructional").unwrap();
        let out = transform(&raw, &rules, 2023).unwrap();
        assert_eq!(out.records.len(), 3);
        assert_eq!(out.records[1].key.parts, vec!["1", "1", "2"]);
        assert_eq!(
            rules.target().conflict_columns(),
            vec!["unitid", "academic_rank", "gender", "year"]
        );
    }
}
